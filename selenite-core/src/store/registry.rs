//! Model registry rows: provider sets and their weights.

use rusqlite::{params, Row};

use crate::clock;
use crate::error::{Result, SeleniteError};

use super::Store;

/// Raw `model_sets` row. `has_weights` is derived by the registry layer,
/// not stored.
#[derive(Debug, Clone)]
pub struct ModelSetRow {
    pub id: i64,
    pub kind: String,
    pub name: String,
    pub abs_path: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub disable_reason: Option<String>,
}

/// Raw `model_weights` row.
#[derive(Debug, Clone)]
pub struct ModelWeightRow {
    pub id: i64,
    pub set_id: i64,
    pub name: String,
    pub abs_path: String,
    pub checksum: Option<String>,
    pub enabled: bool,
    pub disable_reason: Option<String>,
}

/// Partial update for sets and weights. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct RegistryPatch {
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub disable_reason: Option<String>,
}

fn set_from_row(row: &Row<'_>) -> rusqlite::Result<ModelSetRow> {
    Ok(ModelSetRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        abs_path: row.get(3)?,
        description: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        disable_reason: row.get(6)?,
    })
}

fn weight_from_row(row: &Row<'_>) -> rusqlite::Result<ModelWeightRow> {
    Ok(ModelWeightRow {
        id: row.get(0)?,
        set_id: row.get(1)?,
        name: row.get(2)?,
        abs_path: row.get(3)?,
        checksum: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        disable_reason: row.get(6)?,
    })
}

impl Store {
    pub fn insert_model_set(
        &self,
        kind: &str,
        name: &str,
        abs_path: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_sets (kind, name, abs_path, description, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![kind, name, abs_path, description, clock::now_ms()],
        )
        .map_err(|e| super::map_constraint(e, name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_model_weight(
        &self,
        set_id: i64,
        name: &str,
        abs_path: &str,
        checksum: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_weights (set_id, name, abs_path, checksum, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![set_id, name, abs_path, checksum, clock::now_ms()],
        )
        .map_err(|e| super::map_constraint(e, name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_model_sets(&self, kind: &str) -> Result<Vec<ModelSetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, name, abs_path, description, enabled, disable_reason
             FROM model_sets WHERE kind = ?1 ORDER BY name ASC",
        )?;
        let mut rows = stmt.query(params![kind])?;
        let mut sets = Vec::new();
        while let Some(row) = rows.next()? {
            sets.push(set_from_row(row)?);
        }
        Ok(sets)
    }

    pub fn get_model_set(&self, kind: &str, name: &str) -> Result<Option<ModelSetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, name, abs_path, description, enabled, disable_reason
             FROM model_sets WHERE kind = ?1 AND name = ?2",
        )?;
        let mut rows = stmt.query(params![kind, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(set_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_model_set_by_id(&self, set_id: i64) -> Result<Option<ModelSetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, name, abs_path, description, enabled, disable_reason
             FROM model_sets WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![set_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(set_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_model_weights(&self, set_id: i64) -> Result<Vec<ModelWeightRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, set_id, name, abs_path, checksum, enabled, disable_reason
             FROM model_weights WHERE set_id = ?1 ORDER BY name ASC",
        )?;
        let mut rows = stmt.query(params![set_id])?;
        let mut weights = Vec::new();
        while let Some(row) = rows.next()? {
            weights.push(weight_from_row(row)?);
        }
        Ok(weights)
    }

    pub fn get_model_weight(&self, set_id: i64, name: &str) -> Result<Option<ModelWeightRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, set_id, name, abs_path, checksum, enabled, disable_reason
             FROM model_weights WHERE set_id = ?1 AND name = ?2",
        )?;
        let mut rows = stmt.query(params![set_id, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(weight_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_model_set(&self, set_id: i64, patch: &RegistryPatch) -> Result<()> {
        let conn = self.conn()?;
        let mut changed = 0;
        if let Some(description) = &patch.description {
            changed += conn.execute(
                "UPDATE model_sets SET description = ?2 WHERE id = ?1",
                params![set_id, description],
            )?;
        }
        if let Some(enabled) = patch.enabled {
            changed += conn.execute(
                "UPDATE model_sets SET enabled = ?2, disable_reason = ?3 WHERE id = ?1",
                params![
                    set_id,
                    enabled as i64,
                    if enabled { None } else { patch.disable_reason.as_deref() }
                ],
            )?;
        }
        if changed == 0 && self.get_model_set_by_id(set_id)?.is_none() {
            return Err(SeleniteError::NotFound(format!("model set {set_id}")));
        }
        Ok(())
    }

    pub fn update_model_weight(&self, weight_id: i64, patch: &RegistryPatch) -> Result<()> {
        let conn = self.conn()?;
        if let Some(enabled) = patch.enabled {
            let changed = conn.execute(
                "UPDATE model_weights SET enabled = ?2, disable_reason = ?3 WHERE id = ?1",
                params![
                    weight_id,
                    enabled as i64,
                    if enabled { None } else { patch.disable_reason.as_deref() }
                ],
            )?;
            if changed == 0 {
                return Err(SeleniteError::NotFound(format!("model weight {weight_id}")));
            }
        }
        Ok(())
    }

    pub fn set_weight_checksum(&self, weight_id: i64, checksum: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE model_weights SET checksum = ?2 WHERE id = ?1",
            params![weight_id, checksum],
        )?;
        if changed == 0 {
            return Err(SeleniteError::NotFound(format!("model weight {weight_id}")));
        }
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

    #[test]
    fn set_names_are_unique_per_kind() {
        let (_dir, store) = open_store();
        store
            .insert_model_set("asr", "whisper", "/models/whisper", None)
            .expect("insert");
        let err = store
            .insert_model_set("asr", "whisper", "/models/whisper2", None)
            .unwrap_err();
        assert!(matches!(err, SeleniteError::DuplicateName(_)));

        // Same name under a different kind is fine.
        store
            .insert_model_set("diarizer", "whisper", "/models/whisper", None)
            .expect("insert other kind");
    }

    #[test]
    fn weight_names_are_unique_per_set() {
        let (_dir, store) = open_store();
        let set_id = store
            .insert_model_set("asr", "whisper", "/models/whisper", None)
            .expect("insert set");
        store
            .insert_model_weight(set_id, "tiny", "/models/whisper/tiny", None)
            .expect("insert weight");
        let err = store
            .insert_model_weight(set_id, "tiny", "/models/whisper/tiny2", None)
            .unwrap_err();
        assert!(matches!(err, SeleniteError::DuplicateName(_)));
    }

    #[test]
    fn disable_stores_reason_and_enable_clears_it() {
        let (_dir, store) = open_store();
        let set_id = store
            .insert_model_set("asr", "whisper", "/models/whisper", None)
            .expect("insert set");

        store
            .update_model_set(
                set_id,
                &RegistryPatch {
                    enabled: Some(false),
                    disable_reason: Some("maintenance".into()),
                    ..RegistryPatch::default()
                },
            )
            .expect("disable");
        let row = store
            .get_model_set("asr", "whisper")
            .expect("get")
            .expect("present");
        assert!(!row.enabled);
        assert_eq!(row.disable_reason.as_deref(), Some("maintenance"));

        store
            .update_model_set(
                set_id,
                &RegistryPatch {
                    enabled: Some(true),
                    ..RegistryPatch::default()
                },
            )
            .expect("enable");
        let row = store
            .get_model_set("asr", "whisper")
            .expect("get")
            .expect("present");
        assert!(row.enabled);
        assert!(row.disable_reason.is_none());
    }

    #[test]
    fn unknown_ids_report_not_found() {
        let (_dir, store) = open_store();
        let err = store
            .update_model_weight(
                99,
                &RegistryPatch {
                    enabled: Some(false),
                    disable_reason: Some("gone".into()),
                    ..RegistryPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SeleniteError::NotFound(_)));
    }
}
