//! Engine abstraction: the two contracts the executor depends on.
//!
//! An `AsrEngine`/`Diarizer` implementation is cheap to construct and
//! registered once at process start, keyed by provider name. `load()` is the
//! expensive step and produces a session; sessions are stateful, so all
//! mutation is serialised through a handle's `parking_lot::Mutex` and the
//! same loaded session can be shared across jobs via the engine cache.
//!
//! Engines report progress through the supplied sink and observe
//! cancellation/pause through `JobControl::checkpoint()` at segment
//! boundaries — the scheduler never preempts native code.

pub mod cache;
pub mod stub;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SeleniteError};
use crate::progress::ProgressSink;
use crate::scheduler::signals::JobControl;
use crate::transcript::{Segment, SpeakerTurn};

/// Result of a cheap availability probe; must not load the full model.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ok: bool,
    pub requires_gpu: bool,
    pub notes: Vec<String>,
}

impl ProbeResult {
    pub fn available() -> Self {
        Self {
            ok: true,
            requires_gpu: false,
            notes: Vec::new(),
        }
    }

    pub fn unavailable(note: impl Into<String>) -> Self {
        Self {
            ok: false,
            requires_gpu: false,
            notes: vec![note.into()],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Hint forwarded to backends that specialise per language.
    pub language_hint: Option<String>,
}

/// Per-call transcription parameters.
pub struct TranscribeRequest<'a> {
    /// ISO language code, or `None` for auto-detection.
    pub language: Option<&'a str>,
    pub enable_timestamps: bool,
    pub sink: &'a dyn ProgressSink,
    pub control: &'a JobControl,
}

/// Per-call diarization parameters.
pub struct DiarizeRequest<'a> {
    pub requested_speaker_count: Option<u32>,
    pub sink: &'a dyn ProgressSink,
    pub control: &'a JobControl,
}

/// What a transcription pass produced, before speaker attribution.
#[derive(Debug, Clone)]
pub struct TranscriptDraft {
    pub segments: Vec<Segment>,
    pub language_detected: Option<String>,
    pub duration: f64,
}

/// Contract for speech-recognition backends.
pub trait AsrEngine: Send + Sync + 'static {
    fn provider(&self) -> &str;

    /// Cheap availability check for a weight path.
    fn probe(&self, weight_path: &Path) -> ProbeResult;

    /// Load a session for `weight_path`. May take minutes.
    ///
    /// # Errors
    /// `EngineUnavailable` when the backend cannot run here at all,
    /// `EngineTransient` for failures worth retrying once.
    fn load(&self, weight_path: &Path, options: &LoadOptions) -> Result<Box<dyn AsrSession>>;
}

/// A loaded ASR instance. Stateful; serialised through `AsrHandle`.
pub trait AsrSession: Send + 'static {
    fn transcribe(
        &mut self,
        media_path: &Path,
        request: &TranscribeRequest<'_>,
    ) -> Result<TranscriptDraft>;
}

/// Contract for speaker-diarization backends.
pub trait Diarizer: Send + Sync + 'static {
    fn provider(&self) -> &str;

    fn probe(&self, weight_path: &Path) -> ProbeResult;

    fn load(&self, weight_path: &Path, options: &LoadOptions) -> Result<Box<dyn DiarizerSession>>;
}

/// A loaded diarizer instance. Turns carry canonical `SPEAKER_<n>` labels.
pub trait DiarizerSession: Send + 'static {
    fn diarize(
        &mut self,
        media_path: &Path,
        request: &DiarizeRequest<'_>,
    ) -> Result<Vec<SpeakerTurn>>;
}

/// Thread-safe reference-counted handle to a loaded ASR session.
#[derive(Clone)]
pub struct AsrHandle(pub Arc<Mutex<Box<dyn AsrSession>>>);

impl AsrHandle {
    pub fn new(session: Box<dyn AsrSession>) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }
}

impl std::fmt::Debug for AsrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsrHandle").finish_non_exhaustive()
    }
}

/// Thread-safe reference-counted handle to a loaded diarizer session.
#[derive(Clone)]
pub struct DiarizerHandle(pub Arc<Mutex<Box<dyn DiarizerSession>>>);

impl DiarizerHandle {
    pub fn new(session: Box<dyn DiarizerSession>) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }
}

impl std::fmt::Debug for DiarizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiarizerHandle").finish_non_exhaustive()
    }
}

/// Registry of engine implementations, keyed by provider name. Populated at
/// process start; adding a provider means registering its constructor here.
#[derive(Default)]
pub struct EngineCatalog {
    asr: HashMap<String, Arc<dyn AsrEngine>>,
    diarizers: HashMap<String, Arc<dyn Diarizer>>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asr(&mut self, engine: Arc<dyn AsrEngine>) {
        self.asr.insert(engine.provider().to_string(), engine);
    }

    pub fn register_diarizer(&mut self, engine: Arc<dyn Diarizer>) {
        self.diarizers.insert(engine.provider().to_string(), engine);
    }

    pub fn asr(&self, provider: &str) -> Result<Arc<dyn AsrEngine>> {
        self.asr.get(provider).cloned().ok_or_else(|| {
            SeleniteError::EngineUnavailable(format!("no ASR implementation for {provider}"))
        })
    }

    pub fn diarizer(&self, provider: &str) -> Result<Arc<dyn Diarizer>> {
        self.diarizers.get(provider).cloned().ok_or_else(|| {
            SeleniteError::EngineUnavailable(format!("no diarizer implementation for {provider}"))
        })
    }

    pub fn has_asr(&self, provider: &str) -> bool {
        self.asr.contains_key(provider)
    }

    pub fn has_diarizer(&self, provider: &str) -> bool {
        self.diarizers.contains_key(provider)
    }
}
