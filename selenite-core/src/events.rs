//! Job lifecycle events broadcast to subscribers.
//!
//! Status polling via `get_job_status` remains the primary contract; the
//! broadcast stream lets an HTTP layer push updates (SSE, websockets)
//! without polling the store. Slow consumers lag and drop — events are an
//! optimization, never the source of truth.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobStage, JobStatus};

/// Broadcast channel capacity: enough headroom for a burst of progress
/// events across the full worker pool.
const BROADCAST_CAP: usize = 256;

/// Emitted whenever a job changes status or reports persisted progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub stage: Option<JobStage>,
    /// Optional human-readable detail (e.g. a fallback note).
    pub detail: Option<String>,
}

/// Process-wide fan-out point for `JobEvent`s.
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Send an event; returns silently when no subscriber is attached.
    pub fn emit(
        &self,
        job_id: &str,
        status: JobStatus,
        progress_percent: f64,
        stage: Option<JobStage>,
        detail: Option<String>,
    ) {
        let event = JobEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job_id: job_id.to_string(),
            status,
            progress_percent,
            stage,
            detail,
        };
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
