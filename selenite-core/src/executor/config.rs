//! Job configuration resolution and the fallback policy.
//!
//! Fallback order when the requested ASR weight is unavailable:
//! (1) another available weight of the same provider, (2) any available
//! provider/weight of the kind, (3) fail. Diarization degrades instead of
//! failing: an unavailable diarizer drops speaker detection with a note.

use std::sync::Arc;

use crate::error::{Result, SeleniteError};
use crate::job::JobConfig;
use crate::registry::capability::CapabilityResolver;
use crate::registry::{ModelKind, ModelRegistry, ResolvedWeight};

/// Note attached when a job proceeds without its requested diarizer.
pub const DIARIZER_DEGRADED_NOTE: &str = "diarizer unavailable, completed without speaker labels";

/// A concrete execution plan for one attempt.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub asr: ResolvedWeight,
    pub diarizer: Option<ResolvedWeight>,
    pub language: String,
    pub enable_timestamps: bool,
    pub requested_speaker_count: Option<u32>,
    /// The plan already deviates from the requested weight; at most one
    /// fallback is taken per job.
    pub fell_back: bool,
    /// Notes accumulated during resolution, persisted onto the job.
    pub notes: Vec<String>,
}

pub fn fallback_note(provider: &str, weight: &str) -> String {
    format!("fell back to {provider}/{weight}")
}

/// Resolve the job's requested configuration against the registry and the
/// current availability report.
pub fn resolve_plan(
    config: &JobConfig,
    registry: &Arc<ModelRegistry>,
    capability: &Arc<CapabilityResolver>,
) -> Result<ResolvedPlan> {
    let mut notes = Vec::new();

    let (asr, fell_back) = select_asr(
        &config.asr_provider,
        &config.asr_weight,
        None,
        registry,
        capability,
        &mut notes,
    )?;

    let diarizer = if config.enable_speaker_detection {
        match (&config.diarizer_provider, &config.diarizer_weight) {
            (Some(provider), Some(weight))
                if capability.is_diarizer_available(provider, weight)? =>
            {
                Some(registry.resolve(ModelKind::Diarizer, provider, weight)?)
            }
            _ => {
                notes.push(DIARIZER_DEGRADED_NOTE.to_string());
                None
            }
        }
    } else {
        None
    };

    Ok(ResolvedPlan {
        asr,
        diarizer,
        language: config.language.clone(),
        enable_timestamps: config.enable_timestamps,
        requested_speaker_count: config.requested_speaker_count,
        fell_back,
        notes,
    })
}

/// Build the one permitted fallback plan after a runtime
/// `EngineUnavailable`, excluding the weight that just failed. `None` when
/// nothing else is available or the plan already fell back.
pub fn fallback_plan(
    plan: &ResolvedPlan,
    registry: &Arc<ModelRegistry>,
    capability: &Arc<CapabilityResolver>,
) -> Option<ResolvedPlan> {
    if plan.fell_back {
        return None;
    }
    let mut notes = Vec::new();
    let excluded = (plan.asr.provider.as_str(), plan.asr.weight.as_str());
    let (asr, _) = select_fallback(excluded.0, Some(excluded), registry, capability, &mut notes).ok()??;
    Some(ResolvedPlan {
        asr,
        diarizer: plan.diarizer.clone(),
        language: plan.language.clone(),
        enable_timestamps: plan.enable_timestamps,
        requested_speaker_count: plan.requested_speaker_count,
        fell_back: true,
        notes,
    })
}

/// Quick admissibility check for `submit_job`: the requested ASR weight is
/// available, or some fallback would be.
pub fn asr_admissible(
    provider: &str,
    weight: &str,
    capability: &Arc<CapabilityResolver>,
) -> Result<bool> {
    if capability.is_asr_available(provider, weight)? {
        return Ok(true);
    }
    if !capability.available_asr_weights(provider)?.is_empty() {
        return Ok(true);
    }
    Ok(!capability.available_asr_pairs()?.is_empty())
}

fn select_asr(
    provider: &str,
    weight: &str,
    excluded: Option<(&str, &str)>,
    registry: &Arc<ModelRegistry>,
    capability: &Arc<CapabilityResolver>,
    notes: &mut Vec<String>,
) -> Result<(ResolvedWeight, bool)> {
    let is_excluded = excluded == Some((provider, weight));
    if !is_excluded && capability.is_asr_available(provider, weight)? {
        return Ok((registry.resolve(ModelKind::Asr, provider, weight)?, false));
    }

    match select_fallback(provider, excluded, registry, capability, notes)? {
        Some(result) => Ok(result),
        None => Err(SeleniteError::EngineUnavailable(format!(
            "no available ASR weight for {provider}/{weight} and no fallback"
        ))),
    }
}

fn select_fallback(
    preferred_provider: &str,
    excluded: Option<(&str, &str)>,
    registry: &Arc<ModelRegistry>,
    capability: &Arc<CapabilityResolver>,
    notes: &mut Vec<String>,
) -> Result<Option<(ResolvedWeight, bool)>> {
    let is_excluded = |provider: &str, weight: &str| excluded == Some((provider, weight));

    // 1. Same provider, any available weight.
    for candidate in capability.available_asr_weights(preferred_provider)? {
        if is_excluded(preferred_provider, &candidate) {
            continue;
        }
        let resolved = registry.resolve(ModelKind::Asr, preferred_provider, &candidate)?;
        notes.push(fallback_note(preferred_provider, &candidate));
        return Ok(Some((resolved, true)));
    }

    // 2. Any available provider/weight of the kind.
    for (provider, weight) in capability.available_asr_pairs()? {
        if is_excluded(&provider, &weight) {
            continue;
        }
        let resolved = registry.resolve(ModelKind::Asr, &provider, &weight)?;
        notes.push(fallback_note(&provider, &weight));
        return Ok(Some((resolved, true)));
    }

    Ok(None)
}
