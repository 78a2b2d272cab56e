//! Capability resolver: turns registry entries into an availability map.
//!
//! Consumed by the submission path (admission gating), the executor's
//! fallback selection, and the UI. Probes are cheap by contract, but the
//! report is still cached for `CAPABILITY_CACHE_TTL`; `refresh()`
//! invalidates. A probe that panics marks the entry unavailable with the
//! panic text as a note — it never crashes the resolver.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::clock;
use crate::engine::{EngineCatalog, ProbeResult};
use crate::error::Result;
use crate::settings::SettingsGateway;

use super::{ModelKind, ModelRegistry, ModelSet, ModelWeight};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrProviderAvailability {
    pub provider: String,
    pub available: bool,
    /// Names of the weights that are actually runnable right now.
    pub models: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiarizerAvailability {
    /// `provider/weight`.
    pub key: String,
    pub provider: String,
    pub requires_gpu: bool,
    pub available: bool,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    pub asr: Vec<AsrProviderAvailability>,
    pub diarizers: Vec<DiarizerAvailability>,
    pub generated_at: i64,
}

struct CachedReport {
    at: Instant,
    report: AvailabilityReport,
}

pub struct CapabilityResolver {
    registry: Arc<ModelRegistry>,
    catalog: Arc<EngineCatalog>,
    settings: Arc<SettingsGateway>,
    ttl: Duration,
    cache: Mutex<Option<CachedReport>>,
}

impl CapabilityResolver {
    pub fn new(
        registry: Arc<ModelRegistry>,
        catalog: Arc<EngineCatalog>,
        settings: Arc<SettingsGateway>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            catalog,
            settings,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current availability, served from cache while fresh.
    pub fn report(&self) -> Result<AvailabilityReport> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.at.elapsed() < self.ttl {
                    return Ok(cached.report.clone());
                }
            }
        }
        let report = self.build_report()?;
        *self.cache.lock() = Some(CachedReport {
            at: Instant::now(),
            report: report.clone(),
        });
        Ok(report)
    }

    /// Drop the cached report; the next `report()` re-probes.
    pub fn refresh(&self) {
        *self.cache.lock() = None;
    }

    pub fn is_asr_available(&self, provider: &str, weight: &str) -> Result<bool> {
        let report = self.report()?;
        Ok(report
            .asr
            .iter()
            .any(|p| p.provider == provider && p.available && p.models.iter().any(|m| m == weight)))
    }

    pub fn is_diarizer_available(&self, provider: &str, weight: &str) -> Result<bool> {
        let key = format!("{provider}/{weight}");
        let report = self.report()?;
        Ok(report.diarizers.iter().any(|d| d.key == key && d.available))
    }

    /// Runnable ASR weights of `provider`, in registry order.
    pub fn available_asr_weights(&self, provider: &str) -> Result<Vec<String>> {
        let report = self.report()?;
        Ok(report
            .asr
            .iter()
            .find(|p| p.provider == provider && p.available)
            .map(|p| p.models.clone())
            .unwrap_or_default())
    }

    /// All runnable `(provider, weight)` ASR pairs, in registry order.
    pub fn available_asr_pairs(&self) -> Result<Vec<(String, String)>> {
        let report = self.report()?;
        let mut pairs = Vec::new();
        for provider in &report.asr {
            if !provider.available {
                continue;
            }
            for model in &provider.models {
                pairs.push((provider.provider.clone(), model.clone()));
            }
        }
        Ok(pairs)
    }

    fn build_report(&self) -> Result<AvailabilityReport> {
        let enable_empty_weights = self.settings.get().enable_empty_weights;

        let mut asr = Vec::new();
        for set in self.registry.list(ModelKind::Asr)? {
            asr.push(self.probe_asr_set(&set, enable_empty_weights));
        }

        let mut diarizers = Vec::new();
        for set in self.registry.list(ModelKind::Diarizer)? {
            for weight in &set.weights {
                diarizers.push(self.probe_diarizer_weight(&set, weight, enable_empty_weights));
            }
        }

        debug!(
            asr_providers = asr.len(),
            diarizer_weights = diarizers.len(),
            "rebuilt availability report"
        );
        Ok(AvailabilityReport {
            asr,
            diarizers,
            generated_at: clock::now_ms(),
        })
    }

    fn probe_asr_set(&self, set: &ModelSet, enable_empty_weights: bool) -> AsrProviderAvailability {
        let mut notes = Vec::new();
        if !set.enabled {
            notes.push(format!(
                "provider disabled: {}",
                set.disable_reason.as_deref().unwrap_or("no reason recorded")
            ));
            return AsrProviderAvailability {
                provider: set.name.clone(),
                available: false,
                models: Vec::new(),
                notes,
            };
        }
        let Ok(engine) = self.catalog.asr(&set.name) else {
            notes.push("no engine implementation registered".into());
            return AsrProviderAvailability {
                provider: set.name.clone(),
                available: false,
                models: Vec::new(),
                notes,
            };
        };

        let mut models = Vec::new();
        for weight in &set.weights {
            match probe_weight(&set.name, weight, enable_empty_weights, |path| {
                engine.probe(path)
            }) {
                WeightProbe::Available { .. } => models.push(weight.name.clone()),
                WeightProbe::Unavailable(weight_notes) => notes.extend(weight_notes),
            }
        }

        AsrProviderAvailability {
            provider: set.name.clone(),
            available: !models.is_empty(),
            models,
            notes,
        }
    }

    fn probe_diarizer_weight(
        &self,
        set: &ModelSet,
        weight: &ModelWeight,
        enable_empty_weights: bool,
    ) -> DiarizerAvailability {
        let key = format!("{}/{}", set.name, weight.name);
        if !set.enabled {
            return DiarizerAvailability {
                key,
                provider: set.name.clone(),
                requires_gpu: false,
                available: false,
                notes: vec![format!(
                    "provider disabled: {}",
                    set.disable_reason.as_deref().unwrap_or("no reason recorded")
                )],
            };
        }
        let Ok(engine) = self.catalog.diarizer(&set.name) else {
            return DiarizerAvailability {
                key,
                provider: set.name.clone(),
                requires_gpu: false,
                available: false,
                notes: vec!["no engine implementation registered".into()],
            };
        };

        match probe_weight(&set.name, weight, enable_empty_weights, |path| {
            engine.probe(path)
        }) {
            WeightProbe::Available { requires_gpu, notes } => DiarizerAvailability {
                key,
                provider: set.name.clone(),
                requires_gpu,
                available: true,
                notes,
            },
            WeightProbe::Unavailable(notes) => DiarizerAvailability {
                key,
                provider: set.name.clone(),
                requires_gpu: false,
                available: false,
                notes,
            },
        }
    }
}

enum WeightProbe {
    Available { requires_gpu: bool, notes: Vec<String> },
    Unavailable(Vec<String>),
}

fn probe_weight(
    provider: &str,
    weight: &ModelWeight,
    enable_empty_weights: bool,
    probe: impl Fn(&std::path::Path) -> ProbeResult,
) -> WeightProbe {
    let label = format!("{provider}/{}", weight.name);
    if !weight.enabled {
        return WeightProbe::Unavailable(vec![format!(
            "{label}: disabled: {}",
            weight.disable_reason.as_deref().unwrap_or("no reason recorded")
        )]);
    }
    if !weight.abs_path.exists() {
        return WeightProbe::Unavailable(vec![format!("{label}: path missing")]);
    }
    if !weight.has_weights && !enable_empty_weights {
        return WeightProbe::Unavailable(vec![format!("{label}: pending files")]);
    }

    let result = catch_unwind(AssertUnwindSafe(|| probe(&weight.abs_path)));
    match result {
        Ok(probe) if probe.ok => WeightProbe::Available {
            requires_gpu: probe.requires_gpu,
            notes: probe
                .notes
                .into_iter()
                .map(|n| format!("{label}: {n}"))
                .collect(),
        },
        Ok(probe) => WeightProbe::Unavailable(
            probe
                .notes
                .into_iter()
                .map(|n| format!("{label}: {n}"))
                .collect(),
        ),
        Err(payload) => {
            let text = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            WeightProbe::Unavailable(vec![format!("{label}: probe panicked: {text}")])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::ScriptedAsrEngine;
    use crate::engine::{AsrEngine, AsrSession, LoadOptions};
    use crate::settings::ServiceSettings;
    use crate::store::Store;
    use std::path::Path;
    use tempfile::TempDir;

    struct PanickingProbeEngine;

    impl AsrEngine for PanickingProbeEngine {
        fn provider(&self) -> &str {
            "flaky"
        }

        fn probe(&self, _weight_path: &Path) -> ProbeResult {
            panic!("probe exploded");
        }

        fn load(&self, _weight_path: &Path, _options: &LoadOptions) -> Result<Box<dyn AsrSession>> {
            unreachable!("load is never reached in these tests");
        }
    }

    struct Harness {
        _dir: TempDir,
        registry: Arc<ModelRegistry>,
        settings: Arc<SettingsGateway>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(dir.path().join("selenite.db"), 5).expect("store"));
        let models_root = dir.path().join("models");
        std::fs::create_dir_all(&models_root).expect("models root");
        let registry = Arc::new(ModelRegistry::new(Arc::clone(&store), models_root));
        let settings = Arc::new(SettingsGateway::new(store).expect("settings"));
        Harness {
            _dir: dir,
            registry,
            settings,
        }
    }

    fn resolver_with(harness: &Harness, catalog: EngineCatalog, ttl: Duration) -> CapabilityResolver {
        CapabilityResolver::new(
            Arc::clone(&harness.registry),
            Arc::new(catalog),
            Arc::clone(&harness.settings),
            ttl,
        )
    }

    fn seed_asr_weight(harness: &Harness, provider: &str, weight: &str, with_files: bool) -> i64 {
        let set_id = match harness.registry.create_set(
            ModelKind::Asr,
            provider,
            &harness.registry.models_root().join(provider),
            None,
        ) {
            Ok(id) => id,
            Err(_) => {
                harness
                    .registry
                    .list(ModelKind::Asr)
                    .expect("list")
                    .into_iter()
                    .find(|s| s.name == provider)
                    .expect("set")
                    .id
            }
        };
        let dir = harness.registry.models_root().join(provider).join(weight);
        std::fs::create_dir_all(&dir).expect("weight dir");
        if with_files {
            std::fs::write(dir.join("model.bin"), b"weights").expect("weight file");
        }
        harness
            .registry
            .create_weight(set_id, weight, &dir, None)
            .expect("create weight")
    }

    #[test]
    fn empty_weights_are_pending_unless_enabled() {
        let h = harness();
        seed_asr_weight(&h, "whisper", "large", false);
        let mut catalog = EngineCatalog::new();
        catalog.register_asr(Arc::new(ScriptedAsrEngine::new("whisper")));
        let resolver = resolver_with(&h, catalog, Duration::ZERO);

        let report = resolver.report().expect("report");
        assert_eq!(report.asr.len(), 1);
        assert!(!report.asr[0].available);
        assert!(report.asr[0].notes.iter().any(|n| n.contains("pending files")));

        // Flip the admin setting: the same weight becomes admissible.
        let mut settings = ServiceSettings::default();
        settings.enable_empty_weights = true;
        h.settings.update(settings).expect("update settings");
        resolver.refresh();
        let report = resolver.report().expect("report");
        assert!(report.asr[0].available);
        assert_eq!(report.asr[0].models, vec!["large".to_string()]);
    }

    #[test]
    fn probe_panic_becomes_a_note() {
        let h = harness();
        seed_asr_weight(&h, "flaky", "tiny", true);
        let mut catalog = EngineCatalog::new();
        catalog.register_asr(Arc::new(PanickingProbeEngine));
        let resolver = resolver_with(&h, catalog, Duration::ZERO);

        let report = resolver.report().expect("report");
        assert!(!report.asr[0].available);
        assert!(report.asr[0]
            .notes
            .iter()
            .any(|n| n.contains("probe panicked: probe exploded")));
    }

    #[test]
    fn missing_engine_implementation_is_reported() {
        let h = harness();
        seed_asr_weight(&h, "whisper", "tiny", true);
        let resolver = resolver_with(&h, EngineCatalog::new(), Duration::ZERO);
        let report = resolver.report().expect("report");
        assert!(!report.asr[0].available);
        assert!(report.asr[0]
            .notes
            .iter()
            .any(|n| n.contains("no engine implementation")));
    }

    #[test]
    fn report_is_cached_until_refresh() {
        let h = harness();
        seed_asr_weight(&h, "whisper", "tiny", true);
        let mut catalog = EngineCatalog::new();
        catalog.register_asr(Arc::new(ScriptedAsrEngine::new("whisper")));
        let resolver = resolver_with(&h, catalog, Duration::from_secs(300));

        assert!(resolver.is_asr_available("whisper", "tiny").expect("avail"));

        // New weight appears on disk + registry, but the cache still answers.
        seed_asr_weight(&h, "whisper", "base", true);
        assert!(!resolver.is_asr_available("whisper", "base").expect("avail"));

        resolver.refresh();
        assert!(resolver.is_asr_available("whisper", "base").expect("avail"));
    }

    #[test]
    fn available_pairs_follow_registry_order() {
        let h = harness();
        seed_asr_weight(&h, "whisper", "base", true);
        seed_asr_weight(&h, "whisper", "tiny", true);
        let mut catalog = EngineCatalog::new();
        catalog.register_asr(Arc::new(ScriptedAsrEngine::new("whisper")));
        let resolver = resolver_with(&h, catalog, Duration::ZERO);

        let pairs = resolver.available_asr_pairs().expect("pairs");
        assert_eq!(
            pairs,
            vec![
                ("whisper".to_string(), "base".to_string()),
                ("whisper".to_string(), "tiny".to_string()),
            ]
        );
    }
}
