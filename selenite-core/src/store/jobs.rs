//! Job and transcript row access.
//!
//! Lifecycle transitions are guarded updates: the `WHERE status = …` clause
//! is the compare-and-set. A transition that matched zero rows means the row
//! moved under us (or never existed) and is reported as `InvalidState` /
//! `NotFound` instead of being applied blindly.

use rusqlite::types::Type;
use rusqlite::{params, Row};

use crate::clock;
use crate::error::{Result, SeleniteError};
use crate::job::{Job, JobConfig, JobOutcome, JobStage, JobStatus};
use crate::transcript::{Segment, SpeakerEntry, Transcript};

use super::Store;

const JOB_COLUMNS: &str = "id, user_id, original_filename, display_name, saved_path, file_size, \
     mime_type, config_json, status, progress_percent, progress_stage, \
     estimated_total_seconds, estimated_time_left, error_message, notes_json, stalled_at, \
     language_detected, speaker_count, has_timestamps, has_speaker_labels, model_used, \
     asr_provider_used, diarizer_used, diarizer_provider_used, transcript_path, \
     created_at, updated_at, started_at, completed_at, failed_at, cancelled_at, last_heartbeat_at";

fn json_column_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let config_json: String = row.get(7)?;
    let config: JobConfig = serde_json::from_str(&config_json).map_err(json_column_err)?;
    let status_raw: String = row.get(8)?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Text,
            format!("unknown job status {status_raw}").into(),
        )
    })?;
    let stage_raw: Option<String> = row.get(10)?;
    let notes_json: String = row.get(14)?;
    let notes: Vec<String> = serde_json::from_str(&notes_json).map_err(json_column_err)?;

    Ok(Job {
        id: row.get(0)?,
        user_id: row.get(1)?,
        original_filename: row.get(2)?,
        display_name: row.get(3)?,
        saved_path: row.get(4)?,
        file_size: row.get::<_, i64>(5)? as u64,
        mime_type: row.get(6)?,
        config,
        status,
        progress_percent: row.get(9)?,
        progress_stage: stage_raw.as_deref().and_then(JobStage::parse),
        estimated_total_seconds: row.get(11)?,
        estimated_time_left: row.get(12)?,
        error_message: row.get(13)?,
        notes,
        stalled_at: row.get(15)?,
        language_detected: row.get(16)?,
        speaker_count: row.get::<_, Option<i64>>(17)?.map(|v| v as u32),
        has_timestamps: row.get::<_, Option<i64>>(18)?.map(|v| v != 0),
        has_speaker_labels: row.get::<_, Option<i64>>(19)?.map(|v| v != 0),
        model_used: row.get(20)?,
        asr_provider_used: row.get(21)?,
        diarizer_used: row.get(22)?,
        diarizer_provider_used: row.get(23)?,
        transcript_path: row.get(24)?,
        created_at: row.get(25)?,
        updated_at: row.get(26)?,
        started_at: row.get(27)?,
        completed_at: row.get(28)?,
        failed_at: row.get(29)?,
        cancelled_at: row.get(30)?,
        last_heartbeat_at: row.get(31)?,
    })
}

impl Store {
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let config_json = serde_json::to_string(&job.config)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable job config: {e}")))?;
        let notes_json = serde_json::to_string(&job.notes)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable notes: {e}")))?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO jobs
              (id, user_id, original_filename, display_name, saved_path, file_size, mime_type,
               config_json, status, progress_percent, notes_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                job.id,
                job.user_id,
                job.original_filename,
                job.display_name,
                job.saved_path,
                job.file_size as i64,
                job.mime_type,
                config_json,
                job.status.as_str(),
                job.progress_percent,
                notes_json,
                job.created_at,
                job.updated_at,
            ],
        )
        .map_err(|e| super::map_constraint(e, &job.id))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.try_get_job(id)?
            .ok_or_else(|| SeleniteError::NotFound(format!("job {id}")))
    }

    pub fn try_get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let placeholders = statuses
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({placeholders}) ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }

    pub fn list_jobs(&self, user_id: Option<&str>) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut jobs = Vec::new();
        if let Some(user) = user_id {
            let sql =
                format!("SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 ORDER BY created_at ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![user])?;
            while let Some(row) = rows.next()? {
                jobs.push(job_from_row(row)?);
            }
        } else {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                jobs.push(job_from_row(row)?);
            }
        }
        Ok(jobs)
    }

    /// Admit a queued job: `queued → processing`. Fails with `InvalidState`
    /// when the row is no longer queued (cancelled in the meantime, or
    /// already claimed).
    pub fn claim_queued(&self, id: &str) -> Result<()> {
        let now = clock::now_ms();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'processing', started_at = ?2, last_heartbeat_at = ?2,
                             stalled_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not queued")));
        }
        Ok(())
    }

    /// Persist a progress sample. Only applies while `processing` and never
    /// moves the percent backwards; returns whether a row was written.
    pub fn update_progress(
        &self,
        id: &str,
        percent: f64,
        stage: JobStage,
        estimated_total_seconds: Option<f64>,
        estimated_time_left: Option<f64>,
    ) -> Result<bool> {
        let now = clock::now_ms();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET progress_percent = ?2, progress_stage = ?3,
                             estimated_total_seconds = ?4, estimated_time_left = ?5,
                             stalled_at = NULL, last_heartbeat_at = ?6, updated_at = ?6
             WHERE id = ?1 AND status = 'processing' AND progress_percent <= ?2",
            params![
                id,
                percent,
                stage.as_str(),
                estimated_total_seconds,
                estimated_time_left,
                now
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn touch_heartbeat(&self, id: &str, at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET last_heartbeat_at = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![id, at_ms, clock::now_ms()],
        )?;
        Ok(())
    }

    /// Advisory stall flag; set once, cleared by the next progress write.
    pub fn set_stalled(&self, id: &str, at_ms: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET stalled_at = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'processing' AND stalled_at IS NULL",
            params![id, at_ms, clock::now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_paused(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'paused', updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, clock::now_ms()],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not processing")));
        }
        Ok(())
    }

    pub fn mark_resumed(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'processing', updated_at = ?2
             WHERE id = ?1 AND status = 'paused'",
            params![id, clock::now_ms()],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not paused")));
        }
        Ok(())
    }

    /// Cancel a job that never started; `started_at` stays unset.
    pub fn cancel_queued(&self, id: &str) -> Result<()> {
        let now = clock::now_ms();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', cancelled_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not queued")));
        }
        Ok(())
    }

    /// Terminal transition for a job whose worker observed cancellation.
    pub fn finalize_cancelled(&self, id: &str) -> Result<()> {
        let now = clock::now_ms();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', cancelled_at = ?2, transcript_path = NULL,
                             updated_at = ?2
             WHERE id = ?1 AND status IN ('processing', 'paused')",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not in flight")));
        }
        Ok(())
    }

    pub fn finalize_failed(&self, id: &str, error_message: &str) -> Result<()> {
        let now = clock::now_ms();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', failed_at = ?2, error_message = ?3, updated_at = ?2
             WHERE id = ?1 AND status IN ('processing', 'paused')",
            params![id, now, crate::error::truncate_message(error_message)],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not in flight")));
        }
        Ok(())
    }

    /// Commit a completed job: insert the transcript row and flip the job to
    /// `completed` in one transaction. At most one transcript can ever exist
    /// per job — a second insert fails the transaction.
    pub fn finalize_completed(
        &self,
        id: &str,
        outcome: &JobOutcome,
        transcript: &Transcript,
        transcript_path: &str,
    ) -> Result<()> {
        let segments_json = serde_json::to_string(&transcript.segments)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable segments: {e}")))?;
        let speakers_json = serde_json::to_string(&transcript.speakers)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable speakers: {e}")))?;
        let now = clock::now_ms();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = 'completed', progress_percent = 100,
                             progress_stage = 'finalizing', completed_at = ?2,
                             estimated_time_left = 0,
                             language_detected = ?3, speaker_count = ?4, has_timestamps = ?5,
                             has_speaker_labels = ?6, model_used = ?7, asr_provider_used = ?8,
                             diarizer_used = ?9, diarizer_provider_used = ?10,
                             transcript_path = ?11, stalled_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![
                id,
                now,
                outcome.language_detected,
                outcome.speaker_count as i64,
                outcome.has_timestamps as i64,
                outcome.has_speaker_labels as i64,
                outcome.model_used,
                outcome.asr_provider_used,
                outcome.diarizer_used,
                outcome.diarizer_provider_used,
                transcript_path,
            ],
        )?;
        if changed == 0 {
            return Err(SeleniteError::InvalidState(format!("job {id} is not processing")));
        }
        tx.execute(
            "INSERT INTO transcripts (job_id, text, segments_json, speakers_json, language, duration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                transcript.text,
                segments_json,
                speakers_json,
                transcript.language,
                transcript.duration,
                now
            ],
        )
        .map_err(|e| super::map_constraint(e, id))?;
        tx.commit()?;
        Ok(())
    }

    pub fn append_note(&self, id: &str, note: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let notes_json: String = {
            let mut stmt = tx.prepare("SELECT notes_json FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => row.get(0)?,
                None => return Err(SeleniteError::NotFound(format!("job {id}"))),
            }
        };
        let mut notes: Vec<String> = serde_json::from_str(&notes_json)
            .map_err(|e| SeleniteError::InvalidState(format!("corrupt notes column: {e}")))?;
        notes.push(note.to_string());
        let updated = serde_json::to_string(&notes)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable notes: {e}")))?;
        tx.execute(
            "UPDATE jobs SET notes_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, updated, clock::now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Rename with optimistic concurrency: the caller supplies the
    /// `updated_at` it last read, and loses with `ConcurrentUpdate` if the
    /// row moved since.
    pub fn set_display_name(
        &self,
        id: &str,
        display_name: &str,
        expected_updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET display_name = ?2, updated_at = ?3
             WHERE id = ?1 AND updated_at = ?4",
            params![id, display_name, clock::now_ms(), expected_updated_at],
        )?;
        if changed == 0 {
            if self.try_get_job(id)?.is_none() {
                return Err(SeleniteError::NotFound(format!("job {id}")));
            }
            return Err(SeleniteError::ConcurrentUpdate(format!("job {id}")));
        }
        Ok(())
    }

    /// Rewind an interrupted job back to `queued` for the resume manager.
    pub fn requeue_for_resume(&self, id: &str, floor_percent: f64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = 'queued', progress_percent = ?2, started_at = NULL,
                             last_heartbeat_at = NULL, stalled_at = NULL, transcript_path = NULL,
                             estimated_total_seconds = NULL, estimated_time_left = NULL,
                             updated_at = ?3
             WHERE id = ?1 AND status IN ('processing', 'paused')",
            params![id, floor_percent, clock::now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_job_row(&self, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM transcripts WHERE job_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(SeleniteError::NotFound(format!("job {id}")));
        }
        tx.commit()?;
        Ok(())
    }

    // ── Transcript rows ──────────────────────────────────────────────────

    pub fn get_transcript(&self, job_id: &str) -> Result<Transcript> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT text, segments_json, speakers_json, language, duration
             FROM transcripts WHERE job_id = ?1",
        )?;
        let mut rows = stmt.query(params![job_id])?;
        let Some(row) = rows.next()? else {
            return Err(SeleniteError::NotFound(format!("transcript for job {job_id}")));
        };
        let segments_json: String = row.get(1)?;
        let speakers_json: String = row.get(2)?;
        let segments: Vec<Segment> = serde_json::from_str(&segments_json)
            .map_err(|e| SeleniteError::InvalidState(format!("corrupt segments column: {e}")))?;
        let speakers: Vec<SpeakerEntry> = serde_json::from_str(&speakers_json)
            .map_err(|e| SeleniteError::InvalidState(format!("corrupt speakers column: {e}")))?;
        Ok(Transcript {
            job_id: job_id.to_string(),
            text: row.get(0)?,
            segments,
            speakers,
            language: row.get(3)?,
            duration: row.get(4)?,
        })
    }

    pub fn transcript_exists(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transcripts WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Replace the stored transcript payload (speaker rename path). The
    /// segments and roster update together or not at all.
    pub fn update_transcript(&self, transcript: &Transcript) -> Result<()> {
        let segments_json = serde_json::to_string(&transcript.segments)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable segments: {e}")))?;
        let speakers_json = serde_json::to_string(&transcript.speakers)
            .map_err(|e| SeleniteError::InvalidState(format!("unserializable speakers: {e}")))?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE transcripts SET text = ?2, segments_json = ?3, speakers_json = ?4
             WHERE job_id = ?1",
            params![transcript.job_id, transcript.text, segments_json, speakers_json],
        )?;
        if changed == 0 {
            return Err(SeleniteError::NotFound(format!(
                "transcript for job {}",
                transcript.job_id
            )));
        }
        Ok(())
    }
}

impl Store {
    /// Test hook: force a row into an arbitrary lifecycle shape (e.g.
    /// mid-`processing` before a simulated crash). Not for production paths.
    #[doc(hidden)]
    pub fn force_job_state(
        &self,
        id: &str,
        status: JobStatus,
        percent: f64,
        stage: Option<JobStage>,
        transcript_path: Option<&str>,
    ) -> Result<()> {
        let started_at = if status == JobStatus::Queued {
            None
        } else {
            Some(clock::now_ms())
        };
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET status = ?2, progress_percent = ?3, progress_stage = ?4,
                             started_at = ?5, transcript_path = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                percent,
                stage.map(|s| s.as_str()),
                started_at,
                transcript_path,
                clock::now_ms(),
            ],
        )?;
        Ok(())
    }
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

    fn sample_config() -> JobConfig {
        JobConfig {
            asr_provider: "whisper".into(),
            asr_weight: "tiny".into(),
            diarizer_provider: None,
            diarizer_weight: None,
            language: "auto".into(),
            enable_timestamps: true,
            enable_speaker_detection: false,
            requested_speaker_count: None,
        }
    }

    fn sample_job(id: &str) -> Job {
        Job::new_queued(
            id.into(),
            "user-1".into(),
            "talk.wav".into(),
            format!("/storage/media/{id}.wav"),
            1024,
            "audio/wav".into(),
            sample_config(),
            clock::now_ms(),
        )
    }

    fn sample_outcome() -> JobOutcome {
        JobOutcome {
            language_detected: Some("en".into()),
            speaker_count: 0,
            has_timestamps: true,
            has_speaker_labels: false,
            model_used: "tiny".into(),
            asr_provider_used: "whisper".into(),
            diarizer_used: None,
            diarizer_provider_used: None,
        }
    }

    fn sample_transcript(job_id: &str) -> Transcript {
        Transcript::from_segments(
            job_id.into(),
            vec![Segment {
                id: 0,
                start_sec: 0.0,
                end_sec: 1.0,
                text: "hello".into(),
                speaker: None,
            }],
            vec![],
            Some("en".into()),
            1.0,
        )
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (_dir, store) = open_store();
        let job = sample_job("job-a");
        store.insert_job(&job).expect("insert");
        let loaded = store.get_job("job-a").expect("get");
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.config, job.config);
        assert_eq!(loaded.saved_path, job.saved_path);
        assert!(loaded.started_at.is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        let err = store.insert_job(&sample_job("job-a")).unwrap_err();
        assert!(matches!(err, SeleniteError::DuplicateName(_)));
    }

    #[test]
    fn claim_moves_queued_to_processing_once() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.claim_queued("job-a").expect("claim");
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert!(job.last_heartbeat_at.is_some());

        let err = store.claim_queued("job-a").unwrap_err();
        assert!(matches!(err, SeleniteError::InvalidState(_)));
    }

    #[test]
    fn progress_never_moves_backwards() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.claim_queued("job-a").expect("claim");

        assert!(store
            .update_progress("job-a", 40.0, JobStage::Transcribing, None, None)
            .expect("progress"));
        assert!(!store
            .update_progress("job-a", 20.0, JobStage::Transcribing, None, None)
            .expect("progress"));
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.progress_percent, 40.0);
    }

    #[test]
    fn stall_flag_sets_once_and_clears_on_progress() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.claim_queued("job-a").expect("claim");

        assert!(store.set_stalled("job-a", 123).expect("stall"));
        assert!(!store.set_stalled("job-a", 456).expect("stall twice"));
        assert_eq!(store.get_job("job-a").expect("get").stalled_at, Some(123));

        store
            .update_progress("job-a", 50.0, JobStage::Transcribing, None, None)
            .expect("progress");
        assert!(store.get_job("job-a").expect("get").stalled_at.is_none());
    }

    #[test]
    fn finalize_completed_is_transactional_and_unique() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.claim_queued("job-a").expect("claim");

        let transcript = sample_transcript("job-a");
        store
            .finalize_completed("job-a", &sample_outcome(), &transcript, "/t/job-a.json")
            .expect("finalize");

        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);
        assert!(job.completed_at.is_some());
        assert!(job.failed_at.is_none() && job.cancelled_at.is_none());
        assert_eq!(job.transcript_path.as_deref(), Some("/t/job-a.json"));

        let stored = store.get_transcript("job-a").expect("transcript");
        assert_eq!(stored.segments, transcript.segments);

        // A second finalize must fail: the job is no longer processing.
        let err = store
            .finalize_completed("job-a", &sample_outcome(), &transcript, "/t/job-a.json")
            .unwrap_err();
        assert!(matches!(err, SeleniteError::InvalidState(_)));
    }

    #[test]
    fn cancel_queued_leaves_started_at_unset() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.cancel_queued("job-a").expect("cancel");
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.cancelled_at.is_some());
    }

    #[test]
    fn pause_resume_transitions_are_guarded() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        assert!(store.mark_paused("job-a").is_err());

        store.claim_queued("job-a").expect("claim");
        store.mark_paused("job-a").expect("pause");
        assert_eq!(store.get_job("job-a").expect("get").status, JobStatus::Paused);
        store.mark_resumed("job-a").expect("resume");
        assert_eq!(store.get_job("job-a").expect("get").status, JobStatus::Processing);
    }

    #[test]
    fn display_name_cas_detects_concurrent_update() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        let job = store.get_job("job-a").expect("get");

        store
            .set_display_name("job-a", "My talk", job.updated_at)
            .expect("rename");
        let err = store
            .set_display_name("job-a", "Stale", job.updated_at)
            .unwrap_err();
        assert!(matches!(err, SeleniteError::ConcurrentUpdate(_)));
    }

    #[test]
    fn requeue_for_resume_rewinds_in_flight_rows_only() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        assert!(!store.requeue_for_resume("job-a", 10.0).expect("requeue"));

        store.claim_queued("job-a").expect("claim");
        assert!(store.requeue_for_resume("job-a", 10.0).expect("requeue"));
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress_percent, 10.0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn notes_append_in_order() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.append_note("job-a", "first").expect("note");
        store.append_note("job-a", "second").expect("note");
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.notes, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn delete_removes_job_and_transcript() {
        let (_dir, store) = open_store();
        store.insert_job(&sample_job("job-a")).expect("insert");
        store.claim_queued("job-a").expect("claim");
        store
            .finalize_completed("job-a", &sample_outcome(), &sample_transcript("job-a"), "/t/a.json")
            .expect("finalize");

        store.delete_job_row("job-a").expect("delete");
        assert!(store.try_get_job("job-a").expect("get").is_none());
        assert!(!store.transcript_exists("job-a").expect("exists"));
        assert!(matches!(
            store.delete_job_row("job-a").unwrap_err(),
            SeleniteError::NotFound(_)
        ));
    }

    #[test]
    fn list_jobs_by_status_orders_by_creation() {
        let (_dir, store) = open_store();
        let mut first = sample_job("job-a");
        first.created_at = 100;
        let mut second = sample_job("job-b");
        second.created_at = 200;
        store.insert_job(&second).expect("insert");
        store.insert_job(&first).expect("insert");

        let queued = store.list_jobs_by_status(&[JobStatus::Queued]).expect("list");
        let ids: Vec<&str> = queued.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-a", "job-b"]);
    }
}
