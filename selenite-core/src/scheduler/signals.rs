//! Cooperative control signals shared between the scheduler and a worker.
//!
//! Cancellation is a monotonic atomic flag: once set it stays set, and
//! engines observe it at segment boundaries through `checkpoint()`. Pause is
//! two flags — `requested` by the scheduler, `acked` by the worker when it
//! actually parks — so the admission loop can tell a suspended engine from
//! one that cannot suspend and keeps running.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock;
use crate::error::{Result, SeleniteError};

struct ControlInner {
    cancelled: AtomicBool,
    pause_requested: AtomicBool,
    pause_acked: AtomicBool,
    /// Last worker activity (epoch ms); read by the stall detector.
    activity_ms: AtomicI64,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Per-job control handle. Clones share state.
#[derive(Clone)]
pub struct JobControl {
    inner: Arc<ControlInner>,
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                cancelled: AtomicBool::new(false),
                pause_requested: AtomicBool::new(false),
                pause_acked: AtomicBool::new(false),
                activity_ms: AtomicI64::new(clock::now_ms()),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. Monotonic; also wakes a parked checkpoint.
    pub fn request_cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn request_pause(&self) {
        self.inner.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.inner.pause_requested.store(false, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn pause_requested(&self) -> bool {
        self.inner.pause_requested.load(Ordering::SeqCst)
    }

    /// A pause was requested but the worker has not parked yet — the engine
    /// is still running through native code. The admission loop withholds
    /// new admissions while any worker is in this state.
    pub fn pause_pending_ack(&self) -> bool {
        self.inner.pause_requested.load(Ordering::SeqCst)
            && !self.inner.pause_acked.load(Ordering::SeqCst)
    }

    /// Record worker liveness for heartbeat/stall bookkeeping.
    pub fn touch(&self) {
        self.inner.activity_ms.store(clock::now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.inner.activity_ms.load(Ordering::Relaxed)
    }

    /// Cooperative suspension point. Called by engines at segment boundaries
    /// and by the executor between stages.
    ///
    /// Returns `Err(Cancelled)` once cancellation is requested. While a pause
    /// is requested, parks the calling worker (acknowledging the pause)
    /// until resume or cancellation.
    pub fn checkpoint(&self) -> Result<()> {
        self.touch();
        if self.is_cancelled() {
            return Err(SeleniteError::Cancelled);
        }
        if self.inner.pause_requested.load(Ordering::SeqCst) {
            let mut guard = self.inner.lock.lock();
            self.inner.pause_acked.store(true, Ordering::SeqCst);
            while self.inner.pause_requested.load(Ordering::SeqCst) && !self.is_cancelled() {
                // Bounded wait: the flags are re-checked on every wake.
                self.inner
                    .cond
                    .wait_for(&mut guard, Duration::from_millis(200));
            }
            self.inner.pause_acked.store(false, Ordering::SeqCst);
            drop(guard);
            self.touch();
            if self.is_cancelled() {
                return Err(SeleniteError::Cancelled);
            }
        }
        Ok(())
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}
