//! Startup reconciliation of jobs the previous process left behind.
//!
//! Runs before the scheduler admits new work. Rows stuck in `processing`
//! (or `paused`) are rewound to `queued` with their progress floored to the
//! stage start; a transcript artifact belonging to a non-completed row is
//! stale by definition and removed. Completed work is never replayed, and
//! running recovery twice produces the same queue.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::fs::FsGateway;
use crate::job::{Job, JobStatus};
use crate::store::Store;

pub const RESUME_NOTE: &str = "resumed after restart";

pub struct ResumeManager {
    store: Arc<Store>,
    fs: Arc<FsGateway>,
}

impl ResumeManager {
    pub fn new(store: Arc<Store>, fs: Arc<FsGateway>) -> Self {
        Self { store, fs }
    }

    /// Reconcile interrupted rows and return all queued job IDs in
    /// `created_at` order, ready for re-submission.
    pub fn recover(&self) -> Result<Vec<String>> {
        let rows = self.store.list_jobs_by_status(&[
            JobStatus::Processing,
            JobStatus::Paused,
            JobStatus::Queued,
        ])?;

        let mut requeued = 0usize;
        for job in &rows {
            match job.status {
                JobStatus::Processing | JobStatus::Paused => {
                    self.rewind(job)?;
                    requeued += 1;
                }
                _ => {
                    // Already queued: only scrub a stale artifact, if any.
                    self.scrub_stale_artifact(job)?;
                }
            }
        }

        let queued = self.store.list_jobs_by_status(&[JobStatus::Queued])?;
        let ids: Vec<String> = queued.into_iter().map(|job| job.id).collect();
        if requeued > 0 || !ids.is_empty() {
            info!(requeued, queued = ids.len(), "startup recovery complete");
        }
        Ok(ids)
    }

    fn rewind(&self, job: &Job) -> Result<()> {
        let floor = job
            .progress_stage
            .map(|stage| stage.start_percent())
            .unwrap_or(0.0)
            .min(job.progress_percent);
        self.scrub_stale_artifact(job)?;
        let changed = self
            .store
            .with_retry("requeue_for_resume", |store| {
                store.requeue_for_resume(&job.id, floor)
            })?;
        if changed {
            self.store.append_note(&job.id, RESUME_NOTE)?;
            info!(job_id = %job.id, floor, "rewound interrupted job");
        }
        Ok(())
    }

    fn scrub_stale_artifact(&self, job: &Job) -> Result<()> {
        if job.status == JobStatus::Completed {
            return Ok(());
        }
        if job.transcript_path.is_some() {
            if let Err(err) = self.fs.delete_transcript(&job.id) {
                warn!(job_id = %job.id, error = %err, "failed to delete stale transcript");
            }
        }
        // Scratch files from the interrupted run are dead weight either way.
        if let Err(err) = self.fs.cleanup(&job.id) {
            warn!(job_id = %job.id, error = %err, "failed to purge temp dir");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::job::{JobConfig, JobStage};
    use tempfile::TempDir;

    fn harness() -> (TempDir, Arc<Store>, Arc<FsGateway>, ResumeManager) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(dir.path().join("selenite.db"), 5).expect("store"));
        let fs = Arc::new(
            FsGateway::new(dir.path().join("storage"), dir.path().join("models")).expect("fs"),
        );
        let manager = ResumeManager::new(Arc::clone(&store), Arc::clone(&fs));
        (dir, store, fs, manager)
    }

    fn insert_job(store: &Store, id: &str, created_at: i64) {
        let mut job = Job::new_queued(
            id.into(),
            "user".into(),
            "a.wav".into(),
            format!("/storage/media/{id}.wav"),
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
        job.created_at = created_at;
        store.insert_job(&job).expect("insert");
    }

    #[test]
    fn interrupted_processing_jobs_rewind_to_stage_start() {
        let (_dir, store, _fs, manager) = harness();
        insert_job(&store, "job-a", 100);
        store
            .force_job_state("job-a", JobStatus::Processing, 40.0, Some(JobStage::Transcribing), None)
            .expect("force");

        let ids = manager.recover().expect("recover");
        assert_eq!(ids, vec!["job-a".to_string()]);

        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress_percent, JobStage::Transcribing.start_percent());
        assert!(job.started_at.is_none());
        assert_eq!(job.notes, vec![RESUME_NOTE.to_string()]);
    }

    #[test]
    fn recovery_is_idempotent() {
        let (_dir, store, _fs, manager) = harness();
        insert_job(&store, "job-a", 100);
        store
            .force_job_state("job-a", JobStatus::Processing, 40.0, Some(JobStage::Transcribing), None)
            .expect("force");

        let first = manager.recover().expect("first recover");
        let second = manager.recover().expect("second recover");
        assert_eq!(first, second);

        // The resume note is appended exactly once.
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.notes, vec![RESUME_NOTE.to_string()]);
    }

    #[test]
    fn queued_rows_come_back_in_creation_order() {
        let (_dir, store, _fs, manager) = harness();
        insert_job(&store, "job-b", 200);
        insert_job(&store, "job-a", 100);
        insert_job(&store, "job-c", 300);
        store
            .force_job_state("job-c", JobStatus::Processing, 12.0, Some(JobStage::Transcribing), None)
            .expect("force");

        let ids = manager.recover().expect("recover");
        assert_eq!(
            ids,
            vec!["job-a".to_string(), "job-b".to_string(), "job-c".to_string()]
        );
    }

    #[test]
    fn stale_transcript_artifacts_are_deleted() {
        let (_dir, store, fs, manager) = harness();
        insert_job(&store, "job-a", 100);

        // Simulate a crash between artifact write and row commit.
        let artifact = fs.transcript_path("job-a");
        std::fs::write(&artifact, b"{}").expect("stale artifact");
        store
            .force_job_state(
                "job-a",
                JobStatus::Processing,
                95.0,
                Some(JobStage::Finalizing),
                Some(&artifact.to_string_lossy()),
            )
            .expect("force");

        manager.recover().expect("recover");
        assert!(!artifact.exists());
        let job = store.get_job("job-a").expect("get");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.transcript_path.is_none());
    }

    #[test]
    fn terminal_rows_are_untouched() {
        let (_dir, store, fs, manager) = harness();
        insert_job(&store, "job-a", 100);
        let artifact = fs.transcript_path("job-a");
        std::fs::write(&artifact, b"{}").expect("artifact");
        store
            .force_job_state(
                "job-a",
                JobStatus::Completed,
                100.0,
                Some(JobStage::Finalizing),
                Some(&artifact.to_string_lossy()),
            )
            .expect("force");

        let ids = manager.recover().expect("recover");
        assert!(ids.is_empty());
        assert!(artifact.exists());
        assert_eq!(store.get_job("job-a").expect("get").status, JobStatus::Completed);
    }

    #[test]
    fn paused_rows_are_rewound_like_processing_ones() {
        let (_dir, store, _fs, manager) = harness();
        insert_job(&store, "job-a", 100);
        store
            .force_job_state("job-a", JobStatus::Paused, 30.0, Some(JobStage::Transcribing), None)
            .expect("force");

        let ids = manager.recover().expect("recover");
        assert_eq!(ids, vec!["job-a".to_string()]);
        assert_eq!(store.get_job("job-a").expect("get").status, JobStatus::Queued);
    }
}
