//! Persistence gateway: SQLite-backed rows for jobs, transcripts, the
//! settings row, and the model registry.
//!
//! The store is the single owner of rows; everything else holds IDs. A
//! `Connection` is opened per call (WAL journal mode makes concurrent
//! readers cheap), and status-transition writes are guarded
//! `UPDATE … WHERE status = …` statements so a lost race shows up as zero
//! affected rows rather than a corrupted lifecycle.

mod jobs;
mod registry;

pub use registry::{ModelSetRow, ModelWeightRow, RegistryPatch};

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode};
use tracing::warn;

use crate::error::{Result, SeleniteError};
use crate::settings::ServiceSettings;

/// Base delay of the exponential persistence-retry backoff (100ms × 2ⁿ).
const RETRY_BASE_DELAY_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
    persist_retry_max: u32,
}

impl Store {
    /// Open (creating if needed) the database at `db_path` and ensure the
    /// schema exists.
    pub fn open(db_path: PathBuf, persist_retry_max: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path,
            persist_retry_max,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              original_filename TEXT NOT NULL,
              display_name TEXT,
              saved_path TEXT NOT NULL,
              file_size INTEGER NOT NULL,
              mime_type TEXT NOT NULL,
              config_json TEXT NOT NULL,
              status TEXT NOT NULL,
              progress_percent REAL NOT NULL DEFAULT 0,
              progress_stage TEXT,
              estimated_total_seconds REAL,
              estimated_time_left REAL,
              error_message TEXT,
              notes_json TEXT NOT NULL DEFAULT '[]',
              stalled_at INTEGER,
              language_detected TEXT,
              speaker_count INTEGER,
              has_timestamps INTEGER,
              has_speaker_labels INTEGER,
              model_used TEXT,
              asr_provider_used TEXT,
              diarizer_used TEXT,
              diarizer_provider_used TEXT,
              transcript_path TEXT,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL,
              started_at INTEGER,
              completed_at INTEGER,
              failed_at INTEGER,
              cancelled_at INTEGER,
              last_heartbeat_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS transcripts (
              job_id TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
              text TEXT NOT NULL,
              segments_json TEXT NOT NULL,
              speakers_json TEXT NOT NULL,
              language TEXT,
              duration REAL NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS model_sets (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              name TEXT NOT NULL,
              abs_path TEXT NOT NULL,
              description TEXT,
              enabled INTEGER NOT NULL DEFAULT 1,
              disable_reason TEXT,
              created_at INTEGER NOT NULL,
              UNIQUE(kind, name)
            );

            CREATE TABLE IF NOT EXISTS model_weights (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              set_id INTEGER NOT NULL REFERENCES model_sets(id) ON DELETE CASCADE,
              name TEXT NOT NULL,
              abs_path TEXT NOT NULL,
              checksum TEXT,
              enabled INTEGER NOT NULL DEFAULT 1,
              disable_reason TEXT,
              created_at INTEGER NOT NULL,
              UNIQUE(set_id, name)
            );

            CREATE TABLE IF NOT EXISTS settings (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            "#,
        )?;
        Ok(())
    }

    // ── Settings row ─────────────────────────────────────────────────────

    pub fn load_settings(&self) -> Result<Option<ServiceSettings>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT json FROM settings WHERE id = 1")?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let raw: String = row.get(0)?;
        let settings = serde_json::from_str(&raw)
            .map_err(|e| SeleniteError::InvalidState(format!("corrupt settings row: {e}")))?;
        Ok(Some(settings))
    }

    pub fn save_settings(&self, settings: &ServiceSettings) -> Result<()> {
        let json = serde_json::to_string(settings)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable settings: {e}")))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (id, json) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET json = excluded.json",
            params![json],
        )?;
        Ok(())
    }

    // ── Retry policy ─────────────────────────────────────────────────────

    /// Run a write closure, retrying transient database failures with
    /// 100ms × 2ⁿ backoff up to the configured cap. Non-transient errors
    /// (constraint violations, guard misses) surface immediately.
    pub fn with_retry<T>(&self, label: &str, mut op: impl FnMut(&Store) -> Result<T>) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < self.persist_retry_max => {
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << attempt);
                    warn!(label, attempt, error = %err, "transient persistence failure, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_transient(err: &SeleniteError) -> bool {
    match err {
        SeleniteError::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Map a unique-constraint violation to `DuplicateName`.
pub(crate) fn map_constraint(err: rusqlite::Error, name: &str) -> SeleniteError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            return SeleniteError::DuplicateName(name.to_string());
        }
    }
    SeleniteError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("selenite.db"), 5).expect("open store");
        (dir, store)
    }

    #[test]
    fn schema_init_is_idempotent() {
        let (dir, _store) = open_store();
        let reopened = Store::open(dir.path().join("selenite.db"), 5);
        assert!(reopened.is_ok());
    }

    #[test]
    fn settings_row_round_trips() {
        let (_dir, store) = open_store();
        assert!(store.load_settings().expect("load").is_none());

        let mut settings = ServiceSettings::default();
        settings.max_concurrent_jobs = 2;
        store.save_settings(&settings).expect("save");
        let loaded = store.load_settings().expect("load").expect("present");
        assert_eq!(loaded.max_concurrent_jobs, 2);

        settings.max_concurrent_jobs = 4;
        store.save_settings(&settings).expect("overwrite");
        let loaded = store.load_settings().expect("load").expect("present");
        assert_eq!(loaded.max_concurrent_jobs, 4);
    }

    #[test]
    fn with_retry_passes_through_non_transient_errors() {
        let (_dir, store) = open_store();
        let mut calls = 0;
        let result: Result<()> = store.with_retry("test", |_| {
            calls += 1;
            Err(SeleniteError::NotFound("job x".into()))
        });
        assert!(matches!(result, Err(SeleniteError::NotFound(_))));
        assert_eq!(calls, 1);
    }
}
