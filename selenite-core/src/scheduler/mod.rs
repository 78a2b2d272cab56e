//! Job queue and scheduler: FIFO admission into a bounded worker pool.
//!
//! ## Threading
//!
//! A single admission thread owns the `queued → processing` transition: it
//! pops the ready queue in submission order whenever a worker slot is free,
//! claims the row, and spawns one worker thread per admitted job. Workers
//! are plain OS threads because engine calls block for minutes; the
//! admission loop blocks on a condvar signalled by `submit`, worker
//! completion, and `reconfigure`.
//!
//! A worker panic is caught at the scheduler boundary and turned into a
//! `failed` row; it can never deadlock the pool.

pub mod signals;

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, SeleniteError};
use crate::events::EventBus;
use crate::executor::Executor;
use crate::job::JobStatus;
use crate::settings::Tunables;
use crate::store::Store;

use signals::JobControl;

/// Process-wide scheduler counters for observability.
#[derive(Default)]
pub struct SchedulerDiagnostics {
    pub submitted: AtomicU64,
    pub duplicates_ignored: AtomicU64,
    pub admitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub panics_caught: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub submitted: u64,
    pub duplicates_ignored: u64,
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub panics_caught: u64,
}

impl SchedulerDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates_ignored.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            panics_caught: self.panics_caught.load(Ordering::Relaxed),
        }
    }
}

struct WorkerSlot {
    control: JobControl,
    started_at: Instant,
}

struct SchedState {
    ready: VecDeque<String>,
    inflight: HashMap<String, WorkerSlot>,
    max_concurrent: usize,
    next_worker_index: u64,
}

struct Inner {
    state: Mutex<SchedState>,
    cv: Condvar,
    running: AtomicBool,
    executor: Arc<Executor>,
    store: Arc<Store>,
    events: Arc<EventBus>,
    diagnostics: SchedulerDiagnostics,
}

impl Inner {
    /// Admission predicate, under the state lock. A pause that the engine
    /// has not acknowledged withholds all new admissions.
    fn can_admit(&self, state: &SchedState) -> bool {
        if state.ready.is_empty() || state.inflight.len() >= state.max_concurrent {
            return false;
        }
        !state
            .inflight
            .values()
            .any(|slot| slot.control.pause_pending_ack())
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    admission: Mutex<Option<JoinHandle<()>>>,
    graceful_shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        executor: Arc<Executor>,
        store: Arc<Store>,
        events: Arc<EventBus>,
        max_concurrent: u32,
        tunables: &Tunables,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedState {
                    ready: VecDeque::new(),
                    inflight: HashMap::new(),
                    max_concurrent: max_concurrent.clamp(1, 8) as usize,
                    next_worker_index: 0,
                }),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                executor,
                store,
                events,
                diagnostics: SchedulerDiagnostics::default(),
            }),
            admission: Mutex::new(None),
            graceful_shutdown_timeout: tunables.graceful_shutdown_timeout,
        }
    }

    /// Start the admission loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("selenite-admission".into())
            .spawn(move || admission_loop(inner))
            .expect("spawn admission thread");
        *self.admission.lock() = Some(handle);
        info!("scheduler started");
    }

    /// Drain and stop: waits for inflight workers up to the graceful
    /// timeout, then signals cancellation to whatever is left and waits for
    /// the pool to empty.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cv.notify_all();
        if let Some(handle) = self.admission.lock().take() {
            let _ = handle.join();
        }

        let drained = self.wait_for_drain(self.graceful_shutdown_timeout);
        if !drained {
            let controls: Vec<JobControl> = {
                let state = self.inner.state.lock();
                state.inflight.values().map(|s| s.control.clone()).collect()
            };
            warn!(remaining = controls.len(), "graceful drain timed out, cancelling workers");
            for control in controls {
                control.request_cancel();
            }
            if !self.wait_for_drain(self.graceful_shutdown_timeout) {
                warn!("workers still running after cancellation signal");
            }
        }
        info!("scheduler stopped");
    }

    fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.inflight.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner
                .cv
                .wait_for(&mut state, (deadline - now).min(Duration::from_millis(100)));
        }
        true
    }

    /// Enqueue a `queued` job. At-most-once: a job already queued or
    /// inflight is silently ignored.
    pub fn submit(&self, job_id: &str) -> Result<()> {
        let job = self.inner.store.get_job(job_id)?;
        if job.status != JobStatus::Queued {
            return Err(SeleniteError::InvalidState(format!(
                "job {job_id} is {} — only queued jobs can be submitted",
                job.status
            )));
        }
        let mut state = self.inner.state.lock();
        if state.ready.iter().any(|id| id == job_id) || state.inflight.contains_key(job_id) {
            self.inner
                .diagnostics
                .duplicates_ignored
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        state.ready.push_back(job_id.to_string());
        self.inner.diagnostics.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(job_id, position = state.ready.len(), "job enqueued");
        drop(state);
        self.inner.cv.notify_all();
        Ok(())
    }

    /// Cancel a job. Queued jobs transition immediately and do not disturb
    /// the order of others; inflight jobs are signalled and transition when
    /// the worker observes the token. Terminal jobs are a no-op returning
    /// the current state.
    pub fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        {
            let mut state = self.inner.state.lock();
            if let Some(position) = state.ready.iter().position(|id| id == job_id) {
                state.ready.remove(position);
                drop(state);
                self.inner.store.cancel_queued(job_id)?;
                self.inner.diagnostics.cancelled.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .events
                    .emit(job_id, JobStatus::Cancelled, 0.0, None, None);
                info!(job_id, "cancelled queued job");
                return Ok(JobStatus::Cancelled);
            }
            if let Some(slot) = state.inflight.get(job_id) {
                slot.control.request_cancel();
                drop(state);
                info!(job_id, "cancellation signalled to worker");
                return Ok(self.inner.store.get_job(job_id)?.status);
            }
        }

        let job = self.inner.store.get_job(job_id)?;
        match job.status {
            status if status.is_terminal() => Ok(status),
            JobStatus::Queued => {
                // Known to the store but not yet handed to the scheduler.
                self.inner.store.cancel_queued(job_id)?;
                self.inner
                    .events
                    .emit(job_id, JobStatus::Cancelled, 0.0, None, None);
                Ok(JobStatus::Cancelled)
            }
            status => Err(SeleniteError::InvalidState(format!(
                "job {job_id} is {status} but no worker owns it"
            ))),
        }
    }

    /// Pause a processing job: mark the row, then raise the signal so the
    /// engine parks at its next checkpoint.
    pub fn pause(&self, job_id: &str) -> Result<()> {
        let state = self.inner.state.lock();
        let slot = state.inflight.get(job_id).ok_or_else(|| {
            SeleniteError::InvalidState(format!("job {job_id} is not processing"))
        })?;
        let control = slot.control.clone();
        drop(state);

        self.inner.store.mark_paused(job_id)?;
        control.request_pause();
        self.inner.events.emit(job_id, JobStatus::Paused, 0.0, None, None);
        info!(job_id, "pause requested");
        Ok(())
    }

    /// Resume a paused job and wake the admission loop.
    pub fn resume(&self, job_id: &str) -> Result<()> {
        let state = self.inner.state.lock();
        let slot = state.inflight.get(job_id).ok_or_else(|| {
            SeleniteError::InvalidState(format!("job {job_id} is not in flight"))
        })?;
        let control = slot.control.clone();
        drop(state);

        self.inner.store.mark_resumed(job_id)?;
        control.clear_pause();
        self.inner.cv.notify_all();
        self.inner
            .events
            .emit(job_id, JobStatus::Processing, 0.0, None, None);
        info!(job_id, "resumed");
        Ok(())
    }

    /// Hot-reload the worker bound. Shrinking never preempts running jobs;
    /// excess slots drain as workers finish.
    pub fn reconfigure(&self, max_concurrent: u32) {
        let clamped = max_concurrent.clamp(1, 8) as usize;
        {
            let mut state = self.inner.state.lock();
            state.max_concurrent = clamped;
        }
        self.inner.cv.notify_all();
        info!(max_concurrent = clamped, "scheduler reconfigured");
    }

    /// A detachable `reconfigure` closure for the settings watcher.
    pub fn reconfigure_handle(&self) -> impl Fn(u32) + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        move |max_concurrent: u32| {
            let clamped = max_concurrent.clamp(1, 8) as usize;
            {
                let mut state = inner.state.lock();
                state.max_concurrent = clamped;
            }
            inner.cv.notify_all();
            info!(max_concurrent = clamped, "scheduler reconfigured");
        }
    }

    /// Drop a queued job from the ready queue (delete path). Returns whether
    /// it was present.
    pub fn forget(&self, job_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(position) = state.ready.iter().position(|id| id == job_id) {
            state.ready.remove(position);
            true
        } else {
            false
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot()
    }
}

fn admission_loop(inner: Arc<Inner>) {
    loop {
        let (job_id, control) = {
            let mut state = inner.state.lock();
            loop {
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                if inner.can_admit(&state) {
                    if let Some(job_id) = state.ready.pop_front() {
                        let control = JobControl::new();
                        state.inflight.insert(
                            job_id.clone(),
                            WorkerSlot {
                                control: control.clone(),
                                started_at: Instant::now(),
                            },
                        );
                        break (job_id, control);
                    }
                }
                // Timed wait: pause acknowledgements and the running flag
                // change without a condvar signal.
                inner.cv.wait_for(&mut state, Duration::from_millis(200));
            }
        };

        // Claim the row outside the lock. A job cancelled while queued (or
        // deleted) fails the guard and simply vacates the slot.
        match inner.store.claim_queued(&job_id) {
            Ok(()) => {}
            Err(err) => {
                debug!(job_id, error = %err, "admission skipped");
                let mut state = inner.state.lock();
                state.inflight.remove(&job_id);
                drop(state);
                inner.cv.notify_all();
                continue;
            }
        }

        inner.diagnostics.admitted.fetch_add(1, Ordering::Relaxed);
        inner
            .events
            .emit(&job_id, JobStatus::Processing, 0.0, None, None);

        let worker_index = {
            let mut state = inner.state.lock();
            state.next_worker_index += 1;
            state.next_worker_index
        };
        let worker_inner = Arc::clone(&inner);
        let worker_job_id = job_id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("selenite-worker-{worker_index}"))
            .spawn(move || worker_body(worker_inner, worker_job_id, control));
        if let Err(err) = spawned {
            warn!(job_id, error = %err, "failed to spawn worker thread");
            let message = format!("worker spawn failed: {err}");
            let _ = inner
                .store
                .with_retry("finalize_failed", |store| store.finalize_failed(&job_id, &message));
            let mut state = inner.state.lock();
            state.inflight.remove(&job_id);
            drop(state);
            inner.cv.notify_all();
        }
    }
}

fn worker_body(inner: Arc<Inner>, job_id: String, control: JobControl) {
    let started = {
        let state = inner.state.lock();
        state
            .inflight
            .get(&job_id)
            .map(|slot| slot.started_at)
            .unwrap_or_else(Instant::now)
    };

    let run = catch_unwind(AssertUnwindSafe(|| {
        inner.executor.run(&job_id, &control);
    }));
    if let Err(payload) = run {
        inner.diagnostics.panics_caught.fetch_add(1, Ordering::Relaxed);
        let text = panic_payload_to_string(payload.as_ref());
        warn!(job_id, panic = %text, "worker panicked");
        let message = format!("worker panicked: {text}");
        let result = inner
            .store
            .with_retry("finalize_failed", |store| store.finalize_failed(&job_id, &message));
        if let Err(err) = result {
            warn!(job_id, error = %err, "failed to persist panic failure");
        }
    }

    match inner.store.try_get_job(&job_id) {
        Ok(Some(job)) => {
            let counter = match job.status {
                JobStatus::Completed => Some(&inner.diagnostics.completed),
                JobStatus::Failed => Some(&inner.diagnostics.failed),
                JobStatus::Cancelled => Some(&inner.diagnostics.cancelled),
                _ => None,
            };
            if let Some(counter) = counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            debug!(job_id, status = %job.status, elapsed_ms = started.elapsed().as_millis() as u64, "worker finished");
        }
        Ok(None) => debug!(job_id, "job row gone after worker run"),
        Err(err) => warn!(job_id, error = %err, "could not read final job status"),
    }

    let mut state = inner.state.lock();
    state.inflight.remove(&job_id);
    drop(state);
    inner.cv.notify_all();
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_as_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "kaput");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "unknown panic payload");
    }
}
