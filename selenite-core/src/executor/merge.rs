//! Speaker attribution: ASR segments × diarizer turns.
//!
//! Each segment takes the label of the turn with the largest temporal
//! intersection; exact ties go to the turn with the earliest start. Segments
//! overlapping no turn keep no label. The returned speaker list is the
//! ordered set of labels actually appearing in the segments.

use crate::transcript::{Segment, SpeakerTurn};

fn intersection(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
    (a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}

fn best_turn<'a>(segment: &Segment, turns: &'a [SpeakerTurn]) -> Option<&'a SpeakerTurn> {
    let mut best: Option<(&SpeakerTurn, f64)> = None;
    for turn in turns {
        let overlap = intersection(
            segment.start_sec,
            segment.end_sec,
            turn.start_sec,
            turn.end_sec,
        );
        if overlap <= 0.0 {
            continue;
        }
        best = match best {
            None => Some((turn, overlap)),
            Some((current, current_overlap)) => {
                if overlap > current_overlap
                    || (overlap == current_overlap && turn.start_sec < current.start_sec)
                {
                    Some((turn, overlap))
                } else {
                    Some((current, current_overlap))
                }
            }
        };
    }
    best.map(|(turn, _)| turn)
}

/// Attribute speakers in place; returns the ordered label set.
pub fn merge_speaker_turns(segments: &mut [Segment], turns: &[SpeakerTurn]) -> Vec<String> {
    for segment in segments.iter_mut() {
        segment.speaker = best_turn(segment, turns).map(|t| t.speaker_label.clone());
    }
    let mut speakers: Vec<String> = Vec::new();
    for segment in segments.iter() {
        if let Some(label) = &segment.speaker {
            if !speakers.iter().any(|s| s == label) {
                speakers.push(label.clone());
            }
        }
    }
    speakers
}
