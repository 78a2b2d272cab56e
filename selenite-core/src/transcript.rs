//! The transcript artifact: ordered segments plus the speaker roster.
//!
//! One transcript exists per completed job. The JSON file under
//! `<storage>/transcripts/<job_id>.json` and the database row carry the same
//! payload; exporters derive other formats from it on demand.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeleniteError};

/// A recognised speech interval. `speaker` refers to a label in the owning
/// transcript's `speakers` roster, or is absent when no diarizer turn
/// overlapped the segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: u32,
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// A diarizer-produced interval with a canonical label (`SPEAKER_0`, …).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerTurn {
    pub start_sec: f64,
    pub end_sec: f64,
    pub speaker_label: String,
}

/// Roster entry: canonical label plus an optional human-assigned name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerEntry {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub job_id: String,
    /// Full concatenated text, derived from the segments.
    pub text: String,
    pub segments: Vec<Segment>,
    /// Ordered set of labels actually appearing in `segments`.
    pub speakers: Vec<SpeakerEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub duration: f64,
}

impl Transcript {
    /// Assemble the artifact from merged segments. `speakers` must be the
    /// ordered label set produced by the merge step.
    pub fn from_segments(
        job_id: String,
        segments: Vec<Segment>,
        speakers: Vec<String>,
        language: Option<String>,
        duration: f64,
    ) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            job_id,
            text,
            segments,
            speakers: speakers
                .into_iter()
                .map(|label| SpeakerEntry {
                    label,
                    display_name: None,
                })
                .collect(),
            language,
            duration,
        }
    }

    /// Check the segment-ordering invariant: sorted by `start_sec`,
    /// non-decreasing, and `end_sec >= start_sec` for every segment.
    pub fn validate(&self) -> Result<()> {
        let mut prev_start = f64::NEG_INFINITY;
        for segment in &self.segments {
            if segment.end_sec < segment.start_sec {
                return Err(SeleniteError::InvalidState(format!(
                    "segment {} ends before it starts",
                    segment.id
                )));
            }
            if segment.start_sec < prev_start {
                return Err(SeleniteError::InvalidState(format!(
                    "segment {} is out of order",
                    segment.id
                )));
            }
            prev_start = segment.start_sec;
        }
        for segment in &self.segments {
            if let Some(label) = &segment.speaker {
                if !self.speakers.iter().any(|s| &s.label == label) {
                    return Err(SeleniteError::InvalidState(format!(
                        "segment {} references unknown speaker {label}",
                        segment.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rename a speaker: sets the roster `display_name` and rewrites the
    /// `speaker` field of every affected segment in one pass.
    pub fn rename_speaker(&mut self, label: &str, display_name: &str) -> Result<()> {
        let entry = self
            .speakers
            .iter_mut()
            .find(|s| s.label == label)
            .ok_or_else(|| SeleniteError::NotFound(format!("speaker {label}")))?;
        entry.display_name = Some(display_name.to_string());
        Ok(())
    }
}
