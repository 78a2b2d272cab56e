//! Single-job orchestration inside a worker.
//!
//! ## Stages (per attempt)
//!
//! ```text
//! 1. Resolve plan          → registry + capability, fallback selection
//! 2. Load engines          → engine cache (coalesced, timeout-guarded)
//! 3. Transcode/stage media → filesystem gateway
//! 4. Transcribe            → progress scoped to 10..70
//! 5. Diarize (optional)    → progress scoped to 70..90
//! 6. Merge                 → speaker attribution
//! 7. Finalize              → artifact write + transactional row commit
//! ```
//!
//! The worker is the error boundary: every exit path finalizes the row into
//! a terminal state. Cancellation observed before the finalize commit rolls
//! the job into `cancelled` and removes any partial artifact; after the
//! commit it is ignored and the job completes.

pub mod config;
pub mod merge;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, info_span, warn};

use crate::engine::cache::{CacheKey, EngineCache, SessionHandle, SessionLease};
use crate::engine::{DiarizeRequest, EngineCatalog, LoadOptions, TranscribeRequest};
use crate::error::{Result, SeleniteError};
use crate::events::EventBus;
use crate::fs::FsGateway;
use crate::job::{Job, JobOutcome, JobStage, JobStatus};
use crate::progress::ProgressTracker;
use crate::registry::capability::CapabilityResolver;
use crate::registry::{ModelKind, ModelRegistry, ResolvedWeight};
use crate::scheduler::signals::JobControl;
use crate::settings::{ServiceSettings, SettingsGateway};
use crate::store::Store;
use crate::transcript::{SpeakerTurn, Transcript};

use config::{fallback_plan, resolve_plan, ResolvedPlan, DIARIZER_DEGRADED_NOTE};
use merge::merge_speaker_turns;

pub struct Executor {
    store: Arc<Store>,
    fs: Arc<FsGateway>,
    registry: Arc<ModelRegistry>,
    capability: Arc<CapabilityResolver>,
    catalog: Arc<EngineCatalog>,
    cache: EngineCache,
    tracker: ProgressTracker,
    settings: Arc<SettingsGateway>,
    events: Arc<EventBus>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        fs: Arc<FsGateway>,
        registry: Arc<ModelRegistry>,
        capability: Arc<CapabilityResolver>,
        catalog: Arc<EngineCatalog>,
        cache: EngineCache,
        tracker: ProgressTracker,
        settings: Arc<SettingsGateway>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            fs,
            registry,
            capability,
            catalog,
            cache,
            tracker,
            settings,
            events,
        }
    }

    /// Run one job to a terminal state. Never leaves the row in
    /// `processing` unless persistence itself is down — in which case the
    /// resume manager picks the row up on the next startup.
    pub fn run(&self, job_id: &str, control: &JobControl) {
        let span = info_span!("job", job_id);
        let _enter = span.enter();

        let job = match self.store.get_job(job_id) {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "worker could not load job row");
                return;
            }
        };

        self.tracker.register(job_id, control.clone());
        let outcome = self.execute(&job, control);
        self.tracker.unregister(job_id);

        match outcome {
            Ok(()) => {}
            Err(SeleniteError::Cancelled) => self.finalize_cancelled(job_id),
            Err(err) => self.finalize_failed(job_id, &err),
        }

        if let Err(err) = self.fs.cleanup(job_id) {
            warn!(error = %err, "temp cleanup failed");
        }
    }

    fn execute(&self, job: &Job, control: &JobControl) -> Result<()> {
        let settings = self.settings.get();
        let mut plan = resolve_plan(&job.config, &self.registry, &self.capability)?;
        self.record_notes(&job.id, &plan.notes);

        let mut transient_retries = 0u32;
        loop {
            match self.attempt(job, &plan, control, &settings) {
                Ok(()) => return Ok(()),
                Err(SeleniteError::EngineUnavailable(msg)) if !plan.fell_back => {
                    match fallback_plan(&plan, &self.registry, &self.capability) {
                        Some(fallback) => {
                            warn!(error = %msg, to = %fallback.asr.weight, "engine unavailable, taking fallback");
                            self.record_notes(&job.id, &fallback.notes);
                            plan = fallback;
                        }
                        None => return Err(SeleniteError::EngineUnavailable(msg)),
                    }
                }
                Err(SeleniteError::EngineTransient(msg)) if transient_retries < 1 => {
                    transient_retries += 1;
                    warn!(error = %msg, "transient engine failure, retrying once");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(
        &self,
        job: &Job,
        plan: &ResolvedPlan,
        control: &JobControl,
        settings: &ServiceSettings,
    ) -> Result<()> {
        // ── 1. Load engines ──────────────────────────────────────────────
        self.tracker
            .set_stage(&job.id, JobStage::LoadingModel.start_percent(), JobStage::LoadingModel);
        control.checkpoint()?;

        let asr_lease = self.load_asr(&plan.asr, &plan.language)?;
        let diarizer = match &plan.diarizer {
            Some(resolved) => match self.load_diarizer(resolved) {
                Ok(lease) => Some((resolved.clone(), lease)),
                Err(SeleniteError::EngineUnavailable(msg)) => {
                    warn!(error = %msg, "diarizer load failed, proceeding without speaker labels");
                    self.record_notes(&job.id, &[DIARIZER_DEGRADED_NOTE.to_string()]);
                    None
                }
                Err(err) => return Err(err),
            },
            None => None,
        };

        // ── 2. Stage media ───────────────────────────────────────────────
        self.tracker
            .set_stage(&job.id, JobStage::Transcoding.start_percent(), JobStage::Transcoding);
        control.checkpoint()?;
        let staged = self.fs.stage_media(Path::new(&job.saved_path))?;
        let media = if settings.transcode_to_wav {
            self.fs.ensure_wav(&staged, &job.id)?
        } else {
            staged
        };

        // ── 3. Transcribe ────────────────────────────────────────────────
        self.tracker
            .set_stage(&job.id, JobStage::Transcribing.start_percent(), JobStage::Transcribing);
        let sink = self.tracker.scoped(
            &job.id,
            JobStage::Transcribing.start_percent(),
            JobStage::Diarizing.start_percent(),
        );
        let draft = {
            let handle = asr_lease
                .asr()
                .ok_or_else(|| SeleniteError::InvalidState("cached session kind mismatch".into()))?;
            let mut session = handle.0.lock();
            session.transcribe(
                &media,
                &TranscribeRequest {
                    language: Some(plan.language.as_str()),
                    enable_timestamps: plan.enable_timestamps,
                    sink: &sink,
                    control,
                },
            )?
        };
        let mut segments = draft.segments;
        segments.sort_by(|a, b| {
            a.start_sec
                .partial_cmp(&b.start_sec)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (index, segment) in segments.iter_mut().enumerate() {
            segment.id = index as u32;
        }

        // ── 4. Diarize ───────────────────────────────────────────────────
        self.tracker
            .set_stage(&job.id, JobStage::Diarizing.start_percent(), JobStage::Diarizing);
        let (turns, diarizer_used) = match &diarizer {
            Some((resolved, lease)) => {
                let sink = self.tracker.scoped(
                    &job.id,
                    JobStage::Diarizing.start_percent(),
                    JobStage::Merging.start_percent(),
                );
                match self.run_diarizer(lease, &media, plan, &sink, control) {
                    Ok(turns) => (turns, Some(resolved.clone())),
                    Err(SeleniteError::EngineUnavailable(msg)) => {
                        warn!(error = %msg, "diarizer failed, proceeding without speaker labels");
                        self.record_notes(&job.id, &[DIARIZER_DEGRADED_NOTE.to_string()]);
                        (Vec::new(), None)
                    }
                    Err(err) => return Err(err),
                }
            }
            None => (Vec::new(), None),
        };

        // ── 5. Merge ─────────────────────────────────────────────────────
        self.tracker
            .set_stage(&job.id, JobStage::Merging.start_percent(), JobStage::Merging);
        let speakers = merge_speaker_turns(&mut segments, &turns);

        // ── 6. Finalize ──────────────────────────────────────────────────
        self.tracker
            .set_stage(&job.id, JobStage::Finalizing.start_percent(), JobStage::Finalizing);
        // Last cancellation window: after this checkpoint the commit is
        // carried through even if a cancel arrives.
        control.checkpoint()?;

        let language = draft.language_detected.clone().or_else(|| {
            if plan.language == "auto" {
                None
            } else {
                Some(plan.language.clone())
            }
        });
        let transcript = Transcript::from_segments(
            job.id.clone(),
            segments,
            speakers,
            language.clone(),
            draft.duration,
        );
        transcript.validate()?;
        let transcript_path = self.fs.write_transcript(&transcript)?;

        let outcome = JobOutcome {
            language_detected: language,
            speaker_count: transcript.speakers.len() as u32,
            has_timestamps: plan.enable_timestamps && !transcript.segments.is_empty(),
            has_speaker_labels: !turns.is_empty(),
            model_used: plan.asr.weight.clone(),
            asr_provider_used: plan.asr.provider.clone(),
            diarizer_used: diarizer_used.as_ref().map(|d| d.weight.clone()),
            diarizer_provider_used: diarizer_used.as_ref().map(|d| d.provider.clone()),
        };
        self.store.with_retry("finalize_completed", |store| {
            store.finalize_completed(
                &job.id,
                &outcome,
                &transcript,
                &transcript_path.to_string_lossy(),
            )
        })?;

        info!(
            model = %outcome.model_used,
            provider = %outcome.asr_provider_used,
            segments = transcript.segments.len(),
            speakers = outcome.speaker_count,
            "job completed"
        );
        self.events.emit(
            &job.id,
            JobStatus::Completed,
            100.0,
            Some(JobStage::Finalizing),
            None,
        );
        Ok(())
    }

    fn run_diarizer(
        &self,
        lease: &SessionLease,
        media: &Path,
        plan: &ResolvedPlan,
        sink: &dyn crate::progress::ProgressSink,
        control: &JobControl,
    ) -> Result<Vec<SpeakerTurn>> {
        let handle = lease
            .diarizer()
            .ok_or_else(|| SeleniteError::InvalidState("cached session kind mismatch".into()))?;
        let mut session = handle.0.lock();
        session.diarize(
            media,
            &DiarizeRequest {
                requested_speaker_count: plan.requested_speaker_count,
                sink,
                control,
            },
        )
    }

    fn load_asr(&self, resolved: &ResolvedWeight, language: &str) -> Result<SessionLease> {
        let engine = self.catalog.asr(&resolved.provider)?;
        let options = LoadOptions {
            language_hint: if language == "auto" {
                None
            } else {
                Some(language.to_string())
            },
        };
        let weight_path = resolved.weight_path.clone();
        self.cache.get_or_load(
            CacheKey {
                kind: ModelKind::Asr,
                provider: resolved.provider.clone(),
                weight_path: resolved.weight_path.clone(),
            },
            move || {
                engine
                    .load(&weight_path, &options)
                    .map(|session| SessionHandle::Asr(crate::engine::AsrHandle::new(session)))
            },
        )
    }

    fn load_diarizer(&self, resolved: &ResolvedWeight) -> Result<SessionLease> {
        let engine = self.catalog.diarizer(&resolved.provider)?;
        let weight_path = resolved.weight_path.clone();
        self.cache.get_or_load(
            CacheKey {
                kind: ModelKind::Diarizer,
                provider: resolved.provider.clone(),
                weight_path: resolved.weight_path.clone(),
            },
            move || {
                engine
                    .load(&weight_path, &LoadOptions::default())
                    .map(|session| {
                        SessionHandle::Diarizer(crate::engine::DiarizerHandle::new(session))
                    })
            },
        )
    }

    fn record_notes(&self, job_id: &str, notes: &[String]) {
        for note in notes {
            if let Err(err) = self.store.append_note(job_id, note) {
                warn!(error = %err, note, "failed to append job note");
            }
        }
    }

    fn finalize_cancelled(&self, job_id: &str) {
        // A partially written artifact must not outlive the job.
        if let Err(err) = self.fs.delete_transcript(job_id) {
            warn!(error = %err, "failed to remove partial transcript");
        }
        let result = self
            .store
            .with_retry("finalize_cancelled", |store| store.finalize_cancelled(job_id));
        match result {
            Ok(()) => {
                info!("job cancelled");
                self.events
                    .emit(job_id, JobStatus::Cancelled, 0.0, None, None);
            }
            Err(err) => warn!(error = %err, "failed to persist cancellation"),
        }
    }

    fn finalize_failed(&self, job_id: &str, err: &SeleniteError) {
        if let Err(cleanup_err) = self.fs.delete_transcript(job_id) {
            warn!(error = %cleanup_err, "failed to remove partial transcript");
        }
        let message = err.user_message();
        let result = self
            .store
            .with_retry("finalize_failed", |store| store.finalize_failed(job_id, &message));
        match result {
            Ok(()) => {
                warn!(error = %message, "job failed");
                self.events
                    .emit(job_id, JobStatus::Failed, 0.0, None, Some(message));
            }
            Err(persist_err) => {
                // Leave the row for the resume manager; it will re-queue it
                // on the next startup.
                warn!(error = %persist_err, "failed to persist failure state");
            }
        }
    }
}
