//! Scripted engines — deterministic backends without real inference.
//!
//! Used by the host during bring-up and by the test suite to exercise the
//! full queue/executor path: they emit a configured segment script, report
//! progress per segment, honor cancellation at segment boundaries, and can
//! be told to fail in controlled ways.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, SeleniteError};
use crate::transcript::{Segment, SpeakerTurn};

use super::{
    AsrEngine, AsrSession, DiarizeRequest, Diarizer, DiarizerSession, LoadOptions, ProbeResult,
    TranscribeRequest, TranscriptDraft,
};

/// Failure script for loads and calls.
#[derive(Debug, Clone)]
pub enum FailMode {
    None,
    /// Every `load()` fails hard.
    LoadUnavailable(String),
    /// The first `n` transcribe/diarize calls fail transiently.
    TransientCalls(usize),
}

struct ScriptState {
    loads: AtomicUsize,
    calls: AtomicUsize,
    transient_remaining: AtomicUsize,
}

/// Scripted speech recogniser.
pub struct ScriptedAsrEngine {
    provider: String,
    segments: Vec<Segment>,
    language: Option<String>,
    duration: f64,
    segment_delay: Duration,
    probe: ProbeResult,
    fail: FailMode,
    state: Arc<ScriptState>,
}

impl ScriptedAsrEngine {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            segments: vec![
                Segment {
                    id: 0,
                    start_sec: 0.0,
                    end_sec: 1.0,
                    text: "hello".into(),
                    speaker: None,
                },
                Segment {
                    id: 1,
                    start_sec: 1.0,
                    end_sec: 2.0,
                    text: "world".into(),
                    speaker: None,
                },
            ],
            language: Some("en".into()),
            duration: 2.0,
            segment_delay: Duration::ZERO,
            probe: ProbeResult::available(),
            fail: FailMode::None,
            state: Arc::new(ScriptState {
                loads: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                transient_remaining: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = language.map(str::to_string);
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Sleep this long per segment; gives cancellation tests a window.
    pub fn with_segment_delay(mut self, delay: Duration) -> Self {
        self.segment_delay = delay;
        self
    }

    pub fn with_probe(mut self, probe: ProbeResult) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_fail_mode(mut self, fail: FailMode) -> Self {
        if let FailMode::TransientCalls(n) = &fail {
            self.state.transient_remaining.store(*n, Ordering::SeqCst);
        }
        self.fail = fail;
        self
    }

    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

impl AsrEngine for ScriptedAsrEngine {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn probe(&self, _weight_path: &Path) -> ProbeResult {
        self.probe.clone()
    }

    fn load(&self, weight_path: &Path, _options: &LoadOptions) -> Result<Box<dyn AsrSession>> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        if let FailMode::LoadUnavailable(msg) = &self.fail {
            return Err(SeleniteError::EngineUnavailable(msg.clone()));
        }
        debug!(provider = %self.provider, weight = %weight_path.display(), "scripted ASR load");
        Ok(Box::new(ScriptedAsrSession {
            segments: self.segments.clone(),
            language: self.language.clone(),
            duration: self.duration,
            segment_delay: self.segment_delay,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedAsrSession {
    segments: Vec<Segment>,
    language: Option<String>,
    duration: f64,
    segment_delay: Duration,
    state: Arc<ScriptState>,
}

impl AsrSession for ScriptedAsrSession {
    fn transcribe(
        &mut self,
        _media_path: &Path,
        request: &TranscribeRequest<'_>,
    ) -> Result<TranscriptDraft> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .state
            .transient_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SeleniteError::EngineTransient("scripted transient failure".into()));
        }

        let total = self.segments.len().max(1);
        let mut out = Vec::with_capacity(self.segments.len());
        for (index, segment) in self.segments.iter().enumerate() {
            request.control.checkpoint()?;
            if !self.segment_delay.is_zero() {
                std::thread::sleep(self.segment_delay);
            }
            let mut segment = segment.clone();
            if !request.enable_timestamps {
                segment.start_sec = 0.0;
                segment.end_sec = 0.0;
            }
            out.push(segment);
            request
                .sink
                .report(((index + 1) as f64 / total as f64) * 100.0);
        }
        request.control.checkpoint()?;

        let language_detected = match request.language {
            Some("auto") | None => self.language.clone(),
            Some(lang) => Some(lang.to_string()),
        };
        Ok(TranscriptDraft {
            segments: out,
            language_detected,
            duration: self.duration,
        })
    }
}

/// Scripted diarizer.
pub struct ScriptedDiarizer {
    provider: String,
    turns: Vec<SpeakerTurn>,
    probe: ProbeResult,
    fail: FailMode,
    state: Arc<ScriptState>,
}

impl ScriptedDiarizer {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            turns: vec![
                SpeakerTurn {
                    start_sec: 0.0,
                    end_sec: 1.0,
                    speaker_label: "SPEAKER_0".into(),
                },
                SpeakerTurn {
                    start_sec: 1.0,
                    end_sec: 2.0,
                    speaker_label: "SPEAKER_1".into(),
                },
            ],
            probe: ProbeResult::available(),
            fail: FailMode::None,
            state: Arc::new(ScriptState {
                loads: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                transient_remaining: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_turns(mut self, turns: Vec<SpeakerTurn>) -> Self {
        self.turns = turns;
        self
    }

    pub fn with_probe(mut self, probe: ProbeResult) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_fail_mode(mut self, fail: FailMode) -> Self {
        if let FailMode::TransientCalls(n) = &fail {
            self.state.transient_remaining.store(*n, Ordering::SeqCst);
        }
        self.fail = fail;
        self
    }

    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }
}

impl Diarizer for ScriptedDiarizer {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn probe(&self, _weight_path: &Path) -> ProbeResult {
        self.probe.clone()
    }

    fn load(&self, weight_path: &Path, _options: &LoadOptions) -> Result<Box<dyn DiarizerSession>> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        if let FailMode::LoadUnavailable(msg) = &self.fail {
            return Err(SeleniteError::EngineUnavailable(msg.clone()));
        }
        debug!(provider = %self.provider, weight = %weight_path.display(), "scripted diarizer load");
        Ok(Box::new(ScriptedDiarizerSession {
            turns: self.turns.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedDiarizerSession {
    turns: Vec<SpeakerTurn>,
    state: Arc<ScriptState>,
}

impl DiarizerSession for ScriptedDiarizerSession {
    fn diarize(
        &mut self,
        _media_path: &Path,
        request: &DiarizeRequest<'_>,
    ) -> Result<Vec<SpeakerTurn>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .state
            .transient_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SeleniteError::EngineTransient("scripted transient failure".into()));
        }
        request.control.checkpoint()?;

        let mut turns = self.turns.clone();
        if let Some(limit) = request.requested_speaker_count {
            let keep: Vec<String> = turns
                .iter()
                .map(|t| t.speaker_label.clone())
                .collect::<Vec<_>>()
                .into_iter()
                .take(limit as usize)
                .collect();
            turns.retain(|t| keep.contains(&t.speaker_label));
        }
        request.sink.report(100.0);
        Ok(turns)
    }
}
