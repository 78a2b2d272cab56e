//! `SeleniteService` — the facade the HTTP layer talks to.
//!
//! ## Lifecycle
//!
//! ```text
//! SeleniteService::new()   → gateways, registry, cache, scheduler built in
//!                            dependency order
//!     └─► start()          → tracker + scheduler threads up, startup
//!                            recovery re-enqueues interrupted jobs
//!         └─► stop()       → scheduler drains (graceful timeout, then
//!                            cancellation), tracker stops — reverse order
//! ```
//!
//! `start()`/`stop()` are guarded: calling them in the wrong state returns
//! an error or is a no-op rather than panicking.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clock;
use crate::engine::cache::EngineCache;
use crate::engine::EngineCatalog;
use crate::error::{Result, SeleniteError};
use crate::events::{EventBus, JobEvent};
use crate::executor::config::asr_admissible;
use crate::executor::Executor;
use crate::fs::FsGateway;
use crate::job::{Job, JobConfig, JobStatus};
use crate::progress::ProgressTracker;
use crate::registry::capability::{AvailabilityReport, CapabilityResolver};
use crate::registry::ModelRegistry;
use crate::resume::ResumeManager;
use crate::scheduler::{DiagnosticsSnapshot, Scheduler};
use crate::settings::{normalize_language, SettingsGateway, Tunables};
use crate::store::Store;
use crate::transcript::Transcript;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub storage_root: PathBuf,
    pub models_root: PathBuf,
    pub tunables: Tunables,
}

/// Submission payload from the HTTP layer. Optional configuration fields
/// fall back to the admin defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub original_filename: String,
    pub saved_path: String,
    pub file_size: u64,
    pub mime_type: String,
    pub user_id: String,
    #[serde(default)]
    pub asr_provider: Option<String>,
    #[serde(default)]
    pub asr_weight: Option<String>,
    #[serde(default)]
    pub diarizer_provider: Option<String>,
    #[serde(default)]
    pub diarizer_weight: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub enable_timestamps: Option<bool>,
    #[serde(default)]
    pub enable_speaker_detection: Option<bool>,
    #[serde(default)]
    pub requested_speaker_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: String,
}

pub struct SeleniteService {
    store: Arc<Store>,
    fs: Arc<FsGateway>,
    settings: Arc<SettingsGateway>,
    registry: Arc<ModelRegistry>,
    capability: Arc<CapabilityResolver>,
    catalog: Arc<EngineCatalog>,
    events: Arc<EventBus>,
    tracker: ProgressTracker,
    scheduler: Scheduler,
    resume: ResumeManager,
    started: AtomicBool,
    watcher_stop: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SeleniteService {
    /// Build the component graph in dependency order. Engines must already
    /// be registered in `catalog`.
    pub fn new(config: ServiceConfig, catalog: EngineCatalog) -> Result<Self> {
        let tunables = config.tunables.clone();
        let store = Arc::new(Store::open(config.db_path, tunables.persist_retry_max)?);
        let fs = Arc::new(FsGateway::new(config.storage_root, config.models_root.clone())?);
        let settings = Arc::new(SettingsGateway::new(Arc::clone(&store))?);
        let registry = Arc::new(ModelRegistry::new(Arc::clone(&store), config.models_root));
        let catalog = Arc::new(catalog);
        let capability = Arc::new(CapabilityResolver::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&settings),
            tunables.capability_cache_ttl,
        ));
        let cache = EngineCache::new(tunables.engine_cache_max, tunables.engine_load_timeout);
        let events = Arc::new(EventBus::new());
        let tracker = ProgressTracker::new(
            Arc::clone(&store),
            Arc::clone(&events),
            tunables.clone(),
        );
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&fs),
            Arc::clone(&registry),
            Arc::clone(&capability),
            Arc::clone(&catalog),
            cache,
            tracker.clone(),
            Arc::clone(&settings),
            Arc::clone(&events),
        ));
        let scheduler = Scheduler::new(
            executor,
            Arc::clone(&store),
            Arc::clone(&events),
            settings.get().max_concurrent_jobs,
            &tunables,
        );
        let resume = ResumeManager::new(Arc::clone(&store), Arc::clone(&fs));

        Ok(Self {
            store,
            fs,
            settings,
            registry,
            capability,
            catalog,
            events,
            tracker,
            scheduler,
            resume,
            started: AtomicBool::new(false),
            watcher_stop: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        })
    }

    /// Bring the service up: progress tracking, startup recovery, then the
    /// scheduler.
    ///
    /// # Errors
    /// `InvalidState` if already started.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SeleniteError::InvalidState("service already started".into()));
        }
        info!("selenite service starting");
        self.tracker.start();
        self.start_settings_watcher();

        let recovered = self.resume.recover()?;
        self.scheduler.start();
        for job_id in recovered {
            if let Err(err) = self.scheduler.submit(&job_id) {
                warn!(job_id, error = %err, "failed to re-enqueue recovered job");
            }
        }
        info!("selenite service started");
        Ok(())
    }

    /// Drain and shut down in reverse start order. Safe to call twice.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("selenite service stopping");
        self.watcher_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
        self.scheduler.stop();
        self.tracker.stop();
        info!("selenite service stopped");
    }

    fn start_settings_watcher(&self) {
        self.watcher_stop.store(false, Ordering::SeqCst);
        let mut rx = self.settings.subscribe();
        let stop = Arc::clone(&self.watcher_stop);
        let reconfigure = self.scheduler.reconfigure_handle();
        let capability = Arc::clone(&self.capability);
        let handle = std::thread::Builder::new()
            .name("selenite-settings-watch".into())
            .spawn(move || loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                match rx.try_recv() {
                    Ok(settings) => {
                        reconfigure(settings.max_concurrent_jobs);
                        capability.refresh();
                    }
                    Err(broadcast::error::TryRecvError::Empty) => {
                        std::thread::sleep(Duration::from_millis(200));
                    }
                    Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(broadcast::error::TryRecvError::Closed) => return,
                }
            })
            .expect("spawn settings watcher");
        *self.watcher.lock() = Some(handle);
    }

    // ── Job API ──────────────────────────────────────────────────────────

    /// Validate, persist, and enqueue a new job.
    ///
    /// # Errors
    /// `InvalidConfig` when the requested engine configuration is not
    /// admissible (no fallback available either) or the payload is
    /// malformed; `PathEscape`/`NotFound` for a bad media path.
    pub fn submit_job(&self, request: SubmitJobRequest) -> Result<SubmitJobResponse> {
        let settings = self.settings.get();
        if let Some(count) = request.requested_speaker_count {
            if count < 1 {
                return Err(SeleniteError::InvalidConfig(
                    "requested_speaker_count must be at least 1".into(),
                ));
            }
        }

        let config = JobConfig {
            asr_provider: request
                .asr_provider
                .unwrap_or_else(|| settings.default_asr_provider.clone()),
            asr_weight: request
                .asr_weight
                .unwrap_or_else(|| settings.default_asr_weight.clone()),
            diarizer_provider: request
                .diarizer_provider
                .or_else(|| settings.default_diarizer_provider.clone()),
            diarizer_weight: request
                .diarizer_weight
                .or_else(|| settings.default_diarizer_weight.clone()),
            language: normalize_language(
                &request
                    .language
                    .unwrap_or_else(|| settings.default_language.clone()),
            ),
            enable_timestamps: request
                .enable_timestamps
                .unwrap_or(settings.default_enable_timestamps),
            enable_speaker_detection: request
                .enable_speaker_detection
                .unwrap_or(settings.default_enable_speaker_detection),
            requested_speaker_count: request.requested_speaker_count,
        };

        // Media must already sit inside the storage root.
        self.fs.stage_media(Path::new(&request.saved_path))?;

        // Configuration errors surface here, never inside a worker.
        if !asr_admissible(&config.asr_provider, &config.asr_weight, &self.capability)? {
            return Err(SeleniteError::InvalidConfig(format!(
                "no available weight for {}/{} and no fallback",
                config.asr_provider, config.asr_weight
            )));
        }

        let job = Job::new_queued(
            clock::new_job_id(),
            request.user_id,
            request.original_filename,
            request.saved_path,
            request.file_size,
            request.mime_type,
            config,
            clock::now_ms(),
        );
        self.store.insert_job(&job)?;
        self.events.emit(&job.id, JobStatus::Queued, 0.0, None, None);
        self.scheduler.submit(&job.id)?;
        info!(job_id = %job.id, filename = %job.original_filename, "job submitted");

        Ok(SubmitJobResponse {
            job_id: job.id,
            status: JobStatus::Queued,
            created_at: clock::ms_to_rfc3339(job.created_at),
        })
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<Job> {
        self.store.get_job(job_id)
    }

    pub fn get_transcript(&self, job_id: &str) -> Result<Transcript> {
        self.store.get_transcript(job_id)
    }

    pub fn list_jobs(&self, user_id: Option<&str>) -> Result<Vec<Job>> {
        self.store.list_jobs(user_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        self.scheduler.cancel(job_id)
    }

    pub fn pause_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.pause(job_id)
    }

    pub fn resume_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.resume(job_id)
    }

    /// Create a fresh job from an existing one's immutable configuration and
    /// media. The original row is preserved.
    pub fn restart_job(&self, job_id: &str) -> Result<SubmitJobResponse> {
        let original = self.store.get_job(job_id)?;
        let job = Job::new_queued(
            clock::new_job_id(),
            original.user_id.clone(),
            original.original_filename.clone(),
            original.saved_path.clone(),
            original.file_size,
            original.mime_type.clone(),
            original.config.clone(),
            clock::now_ms(),
        );
        self.store.insert_job(&job)?;
        self.store
            .append_note(&job.id, &format!("restarted from {job_id}"))?;
        self.events.emit(&job.id, JobStatus::Queued, 0.0, None, None);
        self.scheduler.submit(&job.id)?;
        info!(job_id = %job.id, original = job_id, "job restarted");
        Ok(SubmitJobResponse {
            job_id: job.id,
            status: JobStatus::Queued,
            created_at: clock::ms_to_rfc3339(job.created_at),
        })
    }

    /// Remove a job, its transcript artifact, and its media file. Rejected
    /// while the job is in flight.
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        let job = self.store.get_job(job_id)?;
        if matches!(job.status, JobStatus::Processing | JobStatus::Paused) {
            return Err(SeleniteError::InvalidState(format!(
                "job {job_id} is {} — cancel it before deleting",
                job.status
            )));
        }
        self.scheduler.forget(job_id);
        if job.status == JobStatus::Queued {
            // Make sure a concurrent admission cannot pick it up anymore.
            let _ = self.store.cancel_queued(job_id);
        }
        self.fs.delete_transcript(job_id)?;
        self.fs.delete_media(Path::new(&job.saved_path))?;
        self.fs.cleanup(job_id)?;
        self.store.delete_job_row(job_id)?;
        info!(job_id, "job deleted");
        Ok(())
    }

    /// Rename a job's display name. Only legal in terminal states.
    pub fn rename_job(&self, job_id: &str, display_name: &str) -> Result<()> {
        let job = self.store.get_job(job_id)?;
        if !job.status.is_terminal() {
            return Err(SeleniteError::InvalidState(format!(
                "job {job_id} is {} — rename is only allowed after completion",
                job.status
            )));
        }
        self.store
            .set_display_name(job_id, display_name, job.updated_at)
    }

    /// Assign a human name to a canonical speaker label. The roster and the
    /// artifact update together; rejected while the job is non-terminal.
    pub fn rename_speaker(&self, job_id: &str, label: &str, display_name: &str) -> Result<()> {
        let job = self.store.get_job(job_id)?;
        if !job.status.is_terminal() {
            return Err(SeleniteError::InvalidState(format!(
                "job {job_id} is {} — speaker rename is only allowed after completion",
                job.status
            )));
        }
        let mut transcript = self.store.get_transcript(job_id)?;
        transcript.rename_speaker(label, display_name)?;
        self.store.update_transcript(&transcript)?;
        self.fs.write_transcript(&transcript)?;
        Ok(())
    }

    // ── Availability / admin ─────────────────────────────────────────────

    pub fn list_availability(&self) -> Result<AvailabilityReport> {
        self.capability.report()
    }

    pub fn refresh_availability(&self) {
        self.capability.refresh();
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<EngineCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &Arc<SettingsGateway> {
        &self.settings
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.scheduler.diagnostics()
    }

    /// Test/ops hook: counts of queued and inflight jobs in the scheduler.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.scheduler.queued_count(), self.scheduler.inflight_count())
    }
}

impl Drop for SeleniteService {
    fn drop(&mut self) {
        self.stop();
    }
}
