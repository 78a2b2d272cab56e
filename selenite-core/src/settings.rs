//! Admin-tunable settings and environment-controlled constants.
//!
//! `ServiceSettings` is the single persisted settings row; the gateway keeps
//! a read-through cache and fans out change notifications after the write
//! commits. `Tunables` are operational constants sourced from environment
//! variables once at startup, with clamped parsing so a bad value degrades to
//! the default rather than aborting.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::store::Store;

/// The admin settings row. Per-user overrides are an HTTP-layer concern;
/// the core only sees the effective values at submission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServiceSettings {
    /// Worker pool bound, clamped to [1, 8]. Hot-reloadable; shrinking never
    /// preempts running jobs.
    pub max_concurrent_jobs: u32,
    pub default_asr_provider: String,
    pub default_asr_weight: String,
    pub default_diarizer_provider: Option<String>,
    pub default_diarizer_weight: Option<String>,
    pub default_language: String,
    pub default_enable_timestamps: bool,
    pub default_enable_speaker_detection: bool,
    /// Stage media to WAV before handing it to the engine.
    pub transcode_to_wav: bool,
    /// When false, admission rejects jobs whose resolved weight has no files
    /// on disk yet.
    pub enable_empty_weights: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            default_asr_provider: "whisper".into(),
            default_asr_weight: "small".into(),
            default_diarizer_provider: None,
            default_diarizer_weight: None,
            default_language: "auto".into(),
            default_enable_timestamps: true,
            default_enable_speaker_detection: false,
            transcode_to_wav: true,
            enable_empty_weights: false,
        }
    }
}

impl ServiceSettings {
    pub fn normalize(&mut self) {
        self.max_concurrent_jobs = self.max_concurrent_jobs.clamp(1, 8);
        self.default_language = normalize_language(&self.default_language);
        self.default_asr_provider = self.default_asr_provider.trim().to_string();
        self.default_asr_weight = self.default_asr_weight.trim().to_string();
        self.default_diarizer_provider = self
            .default_diarizer_provider
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self.default_diarizer_weight = self
            .default_diarizer_weight
            .as_ref()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty());
    }
}

pub fn normalize_language(raw: &str) -> String {
    let lang = raw.trim().to_ascii_lowercase();
    if lang.is_empty() {
        "auto".into()
    } else {
        lang
    }
}

/// Read-through cache over the settings row with change notifications.
///
/// Consumers subscribe once at startup: the scheduler watches
/// `max_concurrent_jobs`, the capability resolver `enable_empty_weights`,
/// the executor `transcode_to_wav` and the defaults.
pub struct SettingsGateway {
    store: Arc<Store>,
    cached: Mutex<ServiceSettings>,
    tx: broadcast::Sender<ServiceSettings>,
}

impl SettingsGateway {
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let mut settings = store.load_settings()?.unwrap_or_default();
        settings.normalize();
        let (tx, _) = broadcast::channel(16);
        Ok(Self {
            store,
            cached: Mutex::new(settings),
            tx,
        })
    }

    /// Snapshot of the current effective settings.
    pub fn get(&self) -> ServiceSettings {
        self.cached.lock().clone()
    }

    /// Persist new settings, then update the cache and fan out the change.
    /// Notifications only go out after the write committed.
    pub fn update(&self, mut settings: ServiceSettings) -> Result<ServiceSettings> {
        settings.normalize();
        self.store.save_settings(&settings)?;
        *self.cached.lock() = settings.clone();
        info!(
            max_concurrent_jobs = settings.max_concurrent_jobs,
            enable_empty_weights = settings.enable_empty_weights,
            "settings updated"
        );
        let _ = self.tx.send(settings.clone());
        Ok(settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceSettings> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Environment-controlled constants
// ---------------------------------------------------------------------------

/// Operational constants, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub heartbeat_interval: Duration,
    pub stall_threshold: Duration,
    pub stall_scan_interval: Duration,
    pub progress_persist_interval: Duration,
    pub engine_load_timeout: Duration,
    pub engine_cache_max: usize,
    pub capability_cache_ttl: Duration,
    pub persist_retry_max: u32,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(120),
            stall_scan_interval: Duration::from_secs(10),
            progress_persist_interval: Duration::from_secs(1),
            engine_load_timeout: Duration::from_secs(300),
            engine_cache_max: 2,
            capability_cache_ttl: Duration::from_secs(30),
            persist_retry_max: 5,
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Tunables {
    /// Read overrides from `SELENITE_*` environment variables. Out-of-range
    /// or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            heartbeat_interval: env_secs("SELENITE_HEARTBEAT_INTERVAL_SECS", d.heartbeat_interval, 1, 60),
            stall_threshold: env_secs("SELENITE_STALL_THRESHOLD_SECS", d.stall_threshold, 10, 3600),
            stall_scan_interval: env_secs("SELENITE_STALL_SCAN_INTERVAL_SECS", d.stall_scan_interval, 1, 600),
            progress_persist_interval: env_secs(
                "SELENITE_PROGRESS_PERSIST_INTERVAL_SECS",
                d.progress_persist_interval,
                1,
                30,
            ),
            engine_load_timeout: env_secs("SELENITE_ENGINE_LOAD_TIMEOUT_SECS", d.engine_load_timeout, 5, 3600),
            engine_cache_max: env_usize("SELENITE_ENGINE_CACHE_MAX", d.engine_cache_max, 1, 16),
            capability_cache_ttl: env_secs("SELENITE_CAPABILITY_CACHE_TTL_SECS", d.capability_cache_ttl, 1, 600),
            persist_retry_max: env_usize("SELENITE_PERSIST_RETRY_MAX", d.persist_retry_max as usize, 1, 10) as u32,
            graceful_shutdown_timeout: env_secs(
                "SELENITE_GRACEFUL_SHUTDOWN_TIMEOUT_SECS",
                d.graceful_shutdown_timeout,
                1,
                600,
            ),
        }
    }
}

fn env_secs(var: &str, default: Duration, min: u64, max: u64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|v| Duration::from_secs(v.clamp(min, max)))
        .unwrap_or(default)
}

fn env_usize(var: &str, default: usize, min: usize, max: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}
