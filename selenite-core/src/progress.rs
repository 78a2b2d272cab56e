//! Per-job progress: percent/stage/ETA, heartbeats, stall detection.
//!
//! Engines report 0..100 within a stage through a scoped sink that clamps
//! into the stage's overall window. Two persistence rules apply: writes are
//! coalesced to one per `PROGRESS_PERSIST_INTERVAL` per job, except a stage
//! change persists immediately. A background thread persists heartbeats from
//! the worker's activity clock and flags jobs whose activity age exceeds the
//! stall threshold. Stall is advisory only — nothing is killed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock;
use crate::events::EventBus;
use crate::job::{JobStage, JobStatus};
use crate::scheduler::signals::JobControl;
use crate::settings::Tunables;
use crate::store::Store;

/// Receives engine-local progress in percent (0..100).
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64);
}

struct TrackedState {
    percent: f64,
    stage: JobStage,
    stage_entered: Instant,
    last_persist: Instant,
    stalled: bool,
}

struct TrackedJob {
    job_id: String,
    control: JobControl,
    state: Mutex<TrackedState>,
}

struct TrackerInner {
    store: Arc<Store>,
    events: Arc<EventBus>,
    tunables: Tunables,
    jobs: Mutex<HashMap<String, Arc<TrackedJob>>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply clonable handle; clones share the tracked-job table.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl ProgressTracker {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>, tunables: Tunables) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store,
                events,
                tunables,
                jobs: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Start the heartbeat/stall thread. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("selenite-progress".into())
            .spawn(move || inner.run_background())
            .expect("spawn progress thread");
        *self.inner.thread.lock() = Some(handle);
    }

    /// Stop the background thread and wait for it.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Begin tracking an admitted job. The control handle supplies the
    /// activity clock for heartbeats and stall detection.
    pub fn register(&self, job_id: &str, control: JobControl) {
        let now = Instant::now();
        let tracked = Arc::new(TrackedJob {
            job_id: job_id.to_string(),
            control,
            state: Mutex::new(TrackedState {
                percent: 0.0,
                stage: JobStage::LoadingModel,
                stage_entered: now,
                last_persist: now,
                stalled: false,
            }),
        });
        self.inner.jobs.lock().insert(job_id.to_string(), tracked);
    }

    pub fn unregister(&self, job_id: &str) {
        self.inner.jobs.lock().remove(job_id);
    }

    /// Enter a stage at an explicit overall percent. Stage changes persist
    /// immediately.
    pub fn set_stage(&self, job_id: &str, percent: f64, stage: JobStage) {
        self.inner.set_stage(job_id, percent, stage);
    }

    /// Sub-sink clamping engine-reported 0..100 into `[lo, hi]` of the
    /// overall percent scale.
    pub fn scoped(&self, job_id: &str, lo: f64, hi: f64) -> ScopedSink {
        ScopedSink {
            inner: Arc::clone(&self.inner),
            job_id: job_id.to_string(),
            lo,
            hi: hi.max(lo),
        }
    }
}

impl TrackerInner {
    fn set_stage(&self, job_id: &str, percent: f64, stage: JobStage) {
        let Some(tracked) = self.jobs.lock().get(job_id).cloned() else {
            return;
        };
        tracked.control.touch();
        let percent = {
            let mut state = tracked.state.lock();
            // Monotonic: never step backwards in (percent, stage rank).
            if stage.rank() < state.stage.rank() {
                return;
            }
            state.percent = state.percent.max(percent.clamp(0.0, 100.0));
            state.stage = stage;
            state.stage_entered = Instant::now();
            state.last_persist = Instant::now();
            state.stalled = false;
            state.percent
        };
        self.persist(job_id, percent, stage, None, None);
    }

    /// Engine-side progress within the current stage, already mapped to the
    /// overall percent scale. Coalesced.
    fn update(&self, job_id: &str, overall_percent: f64) {
        let Some(tracked) = self.jobs.lock().get(job_id).cloned() else {
            return;
        };
        tracked.control.touch();
        let (persist, percent, stage, eta_total, eta_left) = {
            let mut state = tracked.state.lock();
            if overall_percent <= state.percent {
                return;
            }
            state.percent = overall_percent.clamp(0.0, 100.0);
            state.stalled = false;

            let (eta_total, eta_left) =
                stage_eta(state.stage, state.percent, state.stage_entered.elapsed());
            let due = state.last_persist.elapsed() >= self.tunables.progress_persist_interval;
            if due {
                state.last_persist = Instant::now();
            }
            (due, state.percent, state.stage, eta_total, eta_left)
        };
        if persist {
            self.persist(job_id, percent, stage, eta_total, eta_left);
        }
    }

    fn persist(
        &self,
        job_id: &str,
        percent: f64,
        stage: JobStage,
        eta_total: Option<f64>,
        eta_left: Option<f64>,
    ) {
        match self
            .store
            .update_progress(job_id, percent, stage, eta_total, eta_left)
        {
            Ok(true) => {
                self.events
                    .emit(job_id, JobStatus::Processing, percent, Some(stage), None);
            }
            Ok(false) => {
                // Row no longer processing (finalized or paused) — drop the sample.
                debug!(job_id, percent, stage = %stage, "progress write skipped");
            }
            Err(err) => warn!(job_id, error = %err, "failed to persist progress"),
        }
    }

    fn run_background(self: Arc<Self>) {
        let mut last_heartbeat = Instant::now();
        let mut last_scan = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
            if last_heartbeat.elapsed() >= self.tunables.heartbeat_interval {
                last_heartbeat = Instant::now();
                self.persist_heartbeats();
            }
            if last_scan.elapsed() >= self.tunables.stall_scan_interval {
                last_scan = Instant::now();
                self.scan_for_stalls();
            }
        }
    }

    fn persist_heartbeats(&self) {
        let tracked: Vec<Arc<TrackedJob>> = self.jobs.lock().values().cloned().collect();
        for job in tracked {
            let activity = job.control.last_activity_ms();
            if let Err(err) = self.store.touch_heartbeat(&job.job_id, activity) {
                warn!(job_id = %job.job_id, error = %err, "failed to persist heartbeat");
            }
        }
    }

    fn scan_for_stalls(&self) {
        let threshold_ms = self.tunables.stall_threshold.as_millis() as i64;
        let tracked: Vec<Arc<TrackedJob>> = self.jobs.lock().values().cloned().collect();
        let now = clock::now_ms();
        for job in tracked {
            let age = now - job.control.last_activity_ms();
            if age <= threshold_ms {
                continue;
            }
            let mut state = job.state.lock();
            if state.stalled {
                continue;
            }
            state.stalled = true;
            drop(state);
            warn!(job_id = %job.job_id, age_ms = age, "job stalled — no worker activity");
            match self.store.set_stalled(&job.job_id, now) {
                Ok(_) => {}
                Err(err) => warn!(job_id = %job.job_id, error = %err, "failed to flag stall"),
            }
        }
    }
}

/// ETA after the transcribing stage has reported real progress: project the
/// stage total from the completed fraction. Both values stay unset before
/// the first non-zero sample.
fn stage_eta(stage: JobStage, overall_percent: f64, elapsed: Duration) -> (Option<f64>, Option<f64>) {
    if stage != JobStage::Transcribing {
        return (None, None);
    }
    let lo = JobStage::Transcribing.start_percent();
    let hi = JobStage::Diarizing.start_percent();
    let fraction = ((overall_percent - lo) / (hi - lo)).clamp(0.0, 1.0);
    if fraction <= 0.0 {
        return (None, None);
    }
    let elapsed_secs = elapsed.as_secs_f64();
    let total = elapsed_secs / fraction;
    (Some(total), Some((total - elapsed_secs).max(0.0)))
}

pub struct ScopedSink {
    inner: Arc<TrackerInner>,
    job_id: String,
    lo: f64,
    hi: f64,
}

impl ProgressSink for ScopedSink {
    fn report(&self, percent: f64) {
        let local = percent.clamp(0.0, 100.0) / 100.0;
        let overall = self.lo + local * (self.hi - self.lo);
        self.inner.update(&self.job_id, overall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobConfig};
    use tempfile::TempDir;

    fn test_tunables() -> Tunables {
        Tunables {
            progress_persist_interval: Duration::ZERO,
            heartbeat_interval: Duration::from_millis(60),
            stall_threshold: Duration::from_millis(120),
            stall_scan_interval: Duration::from_millis(60),
            ..Tunables::default()
        }
    }

    fn harness(tunables: Tunables) -> (TempDir, Arc<Store>, ProgressTracker) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(dir.path().join("selenite.db"), 5).expect("store"));
        let tracker = ProgressTracker::new(
            Arc::clone(&store),
            Arc::new(EventBus::new()),
            tunables,
        );
        (dir, store, tracker)
    }

    fn processing_job(store: &Store, id: &str) {
        let job = Job::new_queued(
            id.into(),
            "user".into(),
            "a.wav".into(),
            "/storage/media/a.wav".into(),
            10,
            "audio/wav".into(),
            JobConfig {
                asr_provider: "whisper".into(),
                asr_weight: "tiny".into(),
                diarizer_provider: None,
                diarizer_weight: None,
                language: "auto".into(),
                enable_timestamps: true,
                enable_speaker_detection: false,
                requested_speaker_count: None,
            },
            clock::now_ms(),
        );
        store.insert_job(&job).expect("insert");
        store.claim_queued(id).expect("claim");
    }

    #[test]
    fn scoped_sink_maps_local_percent_into_window() {
        let (_dir, store, tracker) = harness(test_tunables());
        processing_job(&store, "job-a");
        tracker.register("job-a", JobControl::new());
        tracker.set_stage("job-a", 10.0, JobStage::Transcribing);

        let sink = tracker.scoped("job-a", 10.0, 70.0);
        sink.report(50.0);
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.progress_percent, 40.0);
        assert_eq!(job.progress_stage, Some(JobStage::Transcribing));

        sink.report(200.0); // clamped to 100 local
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.progress_percent, 70.0);
    }

    #[test]
    fn progress_is_monotonic_within_a_job() {
        let (_dir, store, tracker) = harness(test_tunables());
        processing_job(&store, "job-a");
        tracker.register("job-a", JobControl::new());
        tracker.set_stage("job-a", 10.0, JobStage::Transcribing);

        let sink = tracker.scoped("job-a", 10.0, 70.0);
        sink.report(80.0);
        sink.report(30.0); // stale engine sample, ignored
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.progress_percent, 58.0);
    }

    #[test]
    fn stage_regression_is_ignored() {
        let (_dir, store, tracker) = harness(test_tunables());
        processing_job(&store, "job-a");
        tracker.register("job-a", JobControl::new());
        tracker.set_stage("job-a", 70.0, JobStage::Diarizing);
        tracker.set_stage("job-a", 10.0, JobStage::Transcoding);
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.progress_stage, Some(JobStage::Diarizing));
        assert_eq!(job.progress_percent, 70.0);
    }

    #[test]
    fn coalescing_skips_rapid_samples() {
        let mut tunables = test_tunables();
        tunables.progress_persist_interval = Duration::from_secs(3600);
        let (_dir, store, tracker) = harness(tunables);
        processing_job(&store, "job-a");
        tracker.register("job-a", JobControl::new());
        tracker.set_stage("job-a", 10.0, JobStage::Transcribing);

        let sink = tracker.scoped("job-a", 10.0, 70.0);
        sink.report(50.0);
        sink.report(90.0);
        // Both samples arrived within the persist interval after the stage
        // write: neither is persisted yet.
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.progress_percent, 10.0);
    }

    #[test]
    fn eta_appears_only_during_transcribing_progress() {
        assert_eq!(
            stage_eta(JobStage::LoadingModel, 5.0, Duration::from_secs(10)),
            (None, None)
        );
        assert_eq!(
            stage_eta(JobStage::Transcribing, 10.0, Duration::from_secs(10)),
            (None, None)
        );
        let (total, left) = stage_eta(JobStage::Transcribing, 40.0, Duration::from_secs(30));
        // Half the stage window done in 30s: 60s total, 30s left.
        assert_eq!(total, Some(60.0));
        assert_eq!(left, Some(30.0));
    }

    #[test]
    fn stalled_jobs_are_flagged_and_heartbeats_persisted() {
        let (_dir, store, tracker) = harness(test_tunables());
        processing_job(&store, "job-a");
        let control = JobControl::new();
        tracker.register("job-a", control.clone());
        tracker.start();

        // No activity: the scan must eventually flag the job.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let job = store.get_job("job-a").expect("get");
            if job.stalled_at.is_some() {
                assert!(job.last_heartbeat_at.is_some());
                break;
            }
            assert!(Instant::now() < deadline, "stall never detected");
            std::thread::sleep(Duration::from_millis(20));
        }
        tracker.stop();
    }

    #[test]
    fn active_jobs_are_not_flagged_as_stalled() {
        let (_dir, store, tracker) = harness(test_tunables());
        processing_job(&store, "job-a");
        let control = JobControl::new();
        tracker.register("job-a", control.clone());
        tracker.start();

        for _ in 0..10 {
            control.touch();
            std::thread::sleep(Duration::from_millis(30));
        }
        let job = store.get_job("job-a").expect("get");
        assert!(job.stalled_at.is_none());
        tracker.stop();
    }
}
