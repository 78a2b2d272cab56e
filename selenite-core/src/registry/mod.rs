//! Model registry: admin-declared providers (sets) and their weights.
//!
//! The registry maps logical `(kind, provider, weight)` names to absolute
//! paths under the configured models root. Every stored path is checked with
//! the same normalized-prefix rule the filesystem gateway uses. Disabling a
//! set cascades an *effective* disabled state to its weights — the weight
//! rows themselves are untouched, resolution just refuses them.

pub mod capability;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Result, SeleniteError};
use crate::fs::ensure_within;
use crate::store::{ModelSetRow, ModelWeightRow, RegistryPatch, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Asr,
    Diarizer,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Diarizer => "diarizer",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A weight with its derived on-disk state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelWeight {
    pub id: i64,
    pub set_id: i64,
    pub name: String,
    pub abs_path: PathBuf,
    pub checksum: Option<String>,
    pub enabled: bool,
    pub disable_reason: Option<String>,
    /// True iff `abs_path` resolves and is non-empty.
    pub has_weights: bool,
}

/// A provider with its weights.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSet {
    pub id: i64,
    pub kind: ModelKind,
    pub name: String,
    pub abs_path: PathBuf,
    pub description: Option<String>,
    pub enabled: bool,
    pub disable_reason: Option<String>,
    pub weights: Vec<ModelWeight>,
}

/// Outcome of `resolve`: a concrete weight ready to hand to an engine.
#[derive(Debug, Clone)]
pub struct ResolvedWeight {
    pub kind: ModelKind,
    pub provider: String,
    pub weight: String,
    pub weight_path: PathBuf,
    pub has_weights: bool,
}

/// True iff the path exists and holds actual bytes (non-empty file, or a
/// directory with at least one entry).
fn weight_has_files(path: &Path) -> bool {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() {
            return meta.len() > 0;
        }
        if meta.is_dir() {
            return std::fs::read_dir(path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
        }
    }
    false
}

fn weight_from_row(row: ModelWeightRow) -> ModelWeight {
    let abs_path = PathBuf::from(&row.abs_path);
    let has_weights = weight_has_files(&abs_path);
    ModelWeight {
        id: row.id,
        set_id: row.set_id,
        name: row.name,
        abs_path,
        checksum: row.checksum,
        enabled: row.enabled,
        disable_reason: row.disable_reason,
        has_weights,
    }
}

pub struct ModelRegistry {
    store: Arc<Store>,
    models_root: PathBuf,
}

impl ModelRegistry {
    pub fn new(store: Arc<Store>, models_root: PathBuf) -> Self {
        Self { store, models_root }
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    /// All sets of a kind, weights included.
    pub fn list(&self, kind: ModelKind) -> Result<Vec<ModelSet>> {
        let rows = self.store.list_model_sets(kind.as_str())?;
        rows.into_iter().map(|row| self.hydrate(kind, row)).collect()
    }

    fn hydrate(&self, kind: ModelKind, row: ModelSetRow) -> Result<ModelSet> {
        let weights = self
            .store
            .list_model_weights(row.id)?
            .into_iter()
            .map(weight_from_row)
            .collect();
        Ok(ModelSet {
            id: row.id,
            kind,
            name: row.name,
            abs_path: PathBuf::from(row.abs_path),
            description: row.description,
            enabled: row.enabled,
            disable_reason: row.disable_reason,
            weights,
        })
    }

    pub fn create_set(
        &self,
        kind: ModelKind,
        name: &str,
        abs_path: &Path,
        description: Option<&str>,
    ) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SeleniteError::InvalidConfig("provider name is empty".into()));
        }
        let resolved = ensure_within(&self.models_root, abs_path)?;
        let id = self.store.insert_model_set(
            kind.as_str(),
            name,
            &resolved.to_string_lossy(),
            description,
        )?;
        info!(kind = %kind, provider = name, path = %resolved.display(), "registered model set");
        Ok(id)
    }

    pub fn create_weight(
        &self,
        set_id: i64,
        name: &str,
        abs_path: &Path,
        checksum: Option<&str>,
    ) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SeleniteError::InvalidConfig("weight name is empty".into()));
        }
        let parent = self
            .store
            .get_model_set_by_id(set_id)?
            .ok_or_else(|| SeleniteError::NotFound(format!("model set {set_id}")))?;
        let resolved = ensure_within(&self.models_root, abs_path)?;
        let id = self
            .store
            .insert_model_weight(set_id, name, &resolved.to_string_lossy(), checksum)?;
        info!(provider = %parent.name, weight = name, path = %resolved.display(), "registered model weight");
        Ok(id)
    }

    /// Partial update. Disabling requires a reason.
    pub fn update_set(&self, set_id: i64, patch: RegistryPatch) -> Result<()> {
        if patch.enabled == Some(false) && patch.disable_reason.is_none() {
            return Err(SeleniteError::InvalidConfig(
                "disabling a provider requires a reason".into(),
            ));
        }
        self.store.update_model_set(set_id, &patch)
    }

    pub fn update_weight(&self, weight_id: i64, patch: RegistryPatch) -> Result<()> {
        if patch.enabled == Some(false) && patch.disable_reason.is_none() {
            return Err(SeleniteError::InvalidConfig(
                "disabling a weight requires a reason".into(),
            ));
        }
        self.store.update_model_weight(weight_id, &patch)
    }

    /// Resolve `(kind, provider, weight)` to a concrete path, honoring
    /// enabled flags. A disabled set makes all of its weights effectively
    /// disabled.
    pub fn resolve(&self, kind: ModelKind, provider: &str, weight: &str) -> Result<ResolvedWeight> {
        let set = self
            .store
            .get_model_set(kind.as_str(), provider)?
            .ok_or_else(|| SeleniteError::UnknownProvider {
                kind: kind.as_str().to_string(),
                name: provider.to_string(),
            })?;
        if !set.enabled {
            return Err(SeleniteError::ProviderDisabled {
                name: provider.to_string(),
                reason: set.disable_reason.unwrap_or_else(|| "disabled".into()),
            });
        }
        let row = self
            .store
            .get_model_weight(set.id, weight)?
            .ok_or_else(|| SeleniteError::UnknownWeight {
                kind: kind.as_str().to_string(),
                provider: provider.to_string(),
                weight: weight.to_string(),
            })?;
        if !row.enabled {
            return Err(SeleniteError::WeightDisabled {
                name: weight.to_string(),
                reason: row.disable_reason.unwrap_or_else(|| "disabled".into()),
            });
        }
        let weight_path = PathBuf::from(&row.abs_path);
        let has_weights = weight_has_files(&weight_path);
        Ok(ResolvedWeight {
            kind,
            provider: provider.to_string(),
            weight: weight.to_string(),
            weight_path,
            has_weights,
        })
    }

    /// Verify a weight file against its recorded SHA-256. A mismatch
    /// disables the weight with reason `"checksum mismatch"` and returns
    /// `false`; weights without a recorded checksum pass trivially.
    pub fn verify_checksum(&self, set_id: i64, weight_name: &str) -> Result<bool> {
        let row = self
            .store
            .get_model_weight(set_id, weight_name)?
            .ok_or_else(|| SeleniteError::NotFound(format!("weight {weight_name}")))?;
        let Some(expected) = row.checksum.clone() else {
            return Ok(true);
        };
        let actual = sha256_file(Path::new(&row.abs_path))?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            return Ok(true);
        }
        self.store.update_model_weight(
            row.id,
            &RegistryPatch {
                enabled: Some(false),
                disable_reason: Some("checksum mismatch".into()),
                ..RegistryPatch::default()
            },
        )?;
        Ok(false)
    }
}

/// Streaming SHA-256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(SeleniteError::InvalidConfig(format!(
            "checksum verification requires a file: {}",
            path.display()
        )));
    }
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Arc<Store>, ModelRegistry) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(dir.path().join("selenite.db"), 5).expect("store"));
        let models_root = dir.path().join("models");
        std::fs::create_dir_all(&models_root).expect("models root");
        let registry = ModelRegistry::new(Arc::clone(&store), models_root);
        (dir, store, registry)
    }

    fn seed_weight_files(registry: &ModelRegistry, provider: &str, weight: &str) -> PathBuf {
        let dir = registry.models_root().join(provider).join(weight);
        std::fs::create_dir_all(&dir).expect("weight dir");
        std::fs::write(dir.join("model.bin"), b"weights").expect("weight file");
        dir
    }

    #[test]
    fn create_set_rejects_paths_outside_models_root() {
        let (_dir, _store, registry) = registry();
        let err = registry
            .create_set(ModelKind::Asr, "whisper", Path::new("/etc"), None)
            .unwrap_err();
        assert!(matches!(err, SeleniteError::PathEscape(_)));
    }

    #[test]
    fn resolve_walks_the_error_taxonomy() {
        let (_dir, _store, registry) = registry();
        let err = registry.resolve(ModelKind::Asr, "whisper", "tiny").unwrap_err();
        assert!(matches!(err, SeleniteError::UnknownProvider { .. }));

        let set_path = registry.models_root().join("whisper");
        let set_id = registry
            .create_set(ModelKind::Asr, "whisper", &set_path, None)
            .expect("create set");
        let err = registry.resolve(ModelKind::Asr, "whisper", "tiny").unwrap_err();
        assert!(matches!(err, SeleniteError::UnknownWeight { .. }));

        let weight_path = seed_weight_files(&registry, "whisper", "tiny");
        let weight_id = registry
            .create_weight(set_id, "tiny", &weight_path, None)
            .expect("create weight");

        let resolved = registry
            .resolve(ModelKind::Asr, "whisper", "tiny")
            .expect("resolve");
        assert_eq!(resolved.weight_path, weight_path);
        assert!(resolved.has_weights);

        registry
            .update_weight(
                weight_id,
                RegistryPatch {
                    enabled: Some(false),
                    disable_reason: Some("not installed".into()),
                    ..RegistryPatch::default()
                },
            )
            .expect("disable weight");
        let err = registry.resolve(ModelKind::Asr, "whisper", "tiny").unwrap_err();
        assert!(matches!(err, SeleniteError::WeightDisabled { .. }));
    }

    #[test]
    fn disabled_set_blocks_resolution_of_enabled_weights() {
        let (_dir, _store, registry) = registry();
        let set_id = registry
            .create_set(ModelKind::Asr, "whisper", &registry.models_root().join("whisper"), None)
            .expect("create set");
        let weight_path = seed_weight_files(&registry, "whisper", "tiny");
        registry
            .create_weight(set_id, "tiny", &weight_path, None)
            .expect("create weight");

        registry
            .update_set(
                set_id,
                RegistryPatch {
                    enabled: Some(false),
                    disable_reason: Some("maintenance".into()),
                    ..RegistryPatch::default()
                },
            )
            .expect("disable set");

        let err = registry.resolve(ModelKind::Asr, "whisper", "tiny").unwrap_err();
        assert!(matches!(err, SeleniteError::ProviderDisabled { .. }));

        // Weight row itself is untouched: re-enabling the set restores it.
        registry
            .update_set(
                set_id,
                RegistryPatch {
                    enabled: Some(true),
                    ..RegistryPatch::default()
                },
            )
            .expect("enable set");
        assert!(registry.resolve(ModelKind::Asr, "whisper", "tiny").is_ok());
    }

    #[test]
    fn disable_without_reason_is_rejected() {
        let (_dir, _store, registry) = registry();
        let set_id = registry
            .create_set(ModelKind::Asr, "whisper", &registry.models_root().join("whisper"), None)
            .expect("create set");
        let err = registry
            .update_set(
                set_id,
                RegistryPatch {
                    enabled: Some(false),
                    ..RegistryPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SeleniteError::InvalidConfig(_)));
    }

    #[test]
    fn has_weights_reflects_on_disk_state() {
        let (_dir, _store, registry) = registry();
        let set_id = registry
            .create_set(ModelKind::Asr, "whisper", &registry.models_root().join("whisper"), None)
            .expect("create set");
        let empty_dir = registry.models_root().join("whisper").join("large");
        std::fs::create_dir_all(&empty_dir).expect("empty dir");
        registry
            .create_weight(set_id, "large", &empty_dir, None)
            .expect("create weight");

        let resolved = registry
            .resolve(ModelKind::Asr, "whisper", "large")
            .expect("resolve");
        assert!(!resolved.has_weights);

        let sets = registry.list(ModelKind::Asr).expect("list");
        assert_eq!(sets.len(), 1);
        assert!(!sets[0].weights[0].has_weights);
    }

    #[test]
    fn checksum_mismatch_disables_the_weight() {
        let (_dir, _store, registry) = registry();
        let set_id = registry
            .create_set(ModelKind::Asr, "whisper", &registry.models_root().join("whisper"), None)
            .expect("create set");
        let dir = registry.models_root().join("whisper").join("tiny");
        std::fs::create_dir_all(&dir).expect("dir");
        let file = dir.join("model.bin");
        std::fs::write(&file, b"weights").expect("file");

        let good = sha256_file(&file).expect("digest");
        registry
            .create_weight(set_id, "tiny", &file, Some(&good))
            .expect("create weight");
        assert!(registry.verify_checksum(set_id, "tiny").expect("verify"));

        std::fs::write(&file, b"tampered").expect("tamper");
        assert!(!registry.verify_checksum(set_id, "tiny").expect("verify"));
        let err = registry.resolve(ModelKind::Asr, "whisper", "tiny").unwrap_err();
        match err {
            SeleniteError::WeightDisabled { reason, .. } => {
                assert_eq!(reason, "checksum mismatch");
            }
            other => panic!("expected WeightDisabled, got {other:?}"),
        }
    }
}
