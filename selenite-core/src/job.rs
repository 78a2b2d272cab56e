//! Job rows: the unit of work moving through the queue.
//!
//! A `Job` is created at submission, mutated only by its owning worker (or by
//! the scheduler for admission and cancellation), and always reaches exactly
//! one terminal state unless the process dies mid-finalize — in which case
//! the resume manager reconciles it on the next startup.

use serde::{Deserialize, Serialize};

/// Lifecycle state. Transitions follow a fixed DAG:
/// `queued → processing → {completed, failed, cancelled}` with `paused`
/// reachable only from `processing` and returning to `processing` or
/// `cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage tag reported alongside progress.
///
/// `rank()` gives the total order used for the monotonic-progress guarantee;
/// `start_percent()` is the floor the resume manager rewinds an interrupted
/// job to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    LoadingModel,
    Transcoding,
    Transcribing,
    Diarizing,
    Merging,
    Finalizing,
}

impl JobStage {
    pub fn rank(self) -> u8 {
        match self {
            Self::LoadingModel => 0,
            Self::Transcoding => 1,
            Self::Transcribing => 2,
            Self::Diarizing => 3,
            Self::Merging => 4,
            Self::Finalizing => 5,
        }
    }

    pub fn start_percent(self) -> f64 {
        match self {
            Self::LoadingModel => 0.0,
            Self::Transcoding => 5.0,
            Self::Transcribing => 10.0,
            Self::Diarizing => 70.0,
            Self::Merging => 90.0,
            Self::Finalizing => 95.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadingModel => "loading_model",
            Self::Transcoding => "transcoding",
            Self::Transcribing => "transcribing",
            Self::Diarizing => "diarizing",
            Self::Merging => "merging",
            Self::Finalizing => "finalizing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "loading_model" => Some(Self::LoadingModel),
            "transcoding" => Some(Self::Transcoding),
            "transcribing" => Some(Self::Transcribing),
            "diarizing" => Some(Self::Diarizing),
            "merging" => Some(Self::Merging),
            "finalizing" => Some(Self::Finalizing),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested configuration, immutable once the job row exists. Optional
/// submission fields are filled from the admin defaults before the row is
/// written, so a persisted config is always concrete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub asr_provider: String,
    pub asr_weight: String,
    pub diarizer_provider: Option<String>,
    pub diarizer_weight: Option<String>,
    /// ISO language code or `"auto"`.
    pub language: String,
    pub enable_timestamps: bool,
    pub enable_speaker_detection: bool,
    pub requested_speaker_count: Option<u32>,
}

/// What a finished job produced; written in the same transaction as the
/// transcript row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub language_detected: Option<String>,
    pub speaker_count: u32,
    pub has_timestamps: bool,
    pub has_speaker_labels: bool,
    pub model_used: String,
    pub asr_provider_used: String,
    pub diarizer_used: Option<String>,
    pub diarizer_provider_used: Option<String>,
}

/// A persisted job row. Timestamps are UTC epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub original_filename: String,
    /// Optional user-assigned name; renameable only in terminal states.
    pub display_name: Option<String>,
    /// Absolute path of the stored original media.
    pub saved_path: String,
    pub file_size: u64,
    pub mime_type: String,
    pub config: JobConfig,

    pub status: JobStatus,
    pub progress_percent: f64,
    pub progress_stage: Option<JobStage>,
    pub estimated_total_seconds: Option<f64>,
    pub estimated_time_left: Option<f64>,
    pub error_message: Option<String>,
    /// Append-only operational notes ("fell back to …", "resumed after
    /// restart"), distinct from `error_message`.
    pub notes: Vec<String>,
    pub stalled_at: Option<i64>,

    // Outcome, populated at completion.
    pub language_detected: Option<String>,
    pub speaker_count: Option<u32>,
    pub has_timestamps: Option<bool>,
    pub has_speaker_labels: Option<bool>,
    pub model_used: Option<String>,
    pub asr_provider_used: Option<String>,
    pub diarizer_used: Option<String>,
    pub diarizer_provider_used: Option<String>,
    pub transcript_path: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
}

impl Job {
    /// Construct a fresh `queued` row.
    pub fn new_queued(
        id: String,
        user_id: String,
        original_filename: String,
        saved_path: String,
        file_size: u64,
        mime_type: String,
        config: JobConfig,
        now: i64,
    ) -> Self {
        Self {
            id,
            user_id,
            display_name: None,
            original_filename,
            saved_path,
            file_size,
            mime_type,
            config,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            progress_stage: None,
            estimated_total_seconds: None,
            estimated_time_left: None,
            error_message: None,
            notes: Vec::new(),
            stalled_at: None,
            language_detected: None,
            speaker_count: None,
            has_timestamps: None,
            has_speaker_labels: None,
            model_used: None,
            asr_provider_used: None,
            diarizer_used: None,
            diarizer_provider_used: None,
            transcript_path: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            last_heartbeat_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_three() {
        let terminal: Vec<JobStatus> = [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(
            terminal,
            vec![JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
        );
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("skipped"), None);
    }

    #[test]
    fn stage_ranks_are_strictly_increasing() {
        let stages = [
            JobStage::LoadingModel,
            JobStage::Transcoding,
            JobStage::Transcribing,
            JobStage::Diarizing,
            JobStage::Merging,
            JobStage::Finalizing,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
            assert!(pair[0].start_percent() < pair[1].start_percent());
        }
    }

    #[test]
    fn job_config_serializes_with_camel_case() {
        let config = JobConfig {
            asr_provider: "whisper".into(),
            asr_weight: "tiny".into(),
            diarizer_provider: None,
            diarizer_weight: None,
            language: "auto".into(),
            enable_timestamps: true,
            enable_speaker_detection: false,
            requested_speaker_count: None,
        };
        let json = serde_json::to_value(&config).expect("serialize config");
        assert_eq!(json["asrProvider"], "whisper");
        assert_eq!(json["enableTimestamps"], true);
    }
}
