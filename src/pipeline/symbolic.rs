//! Note-event-branch stages.
//!
//! Symbolic input skips separation and conversion entirely: the document is
//! loaded, scored for structural quality, analyzed per canonical channel
//! with exact event counts, and re-emitted on canonical channels. Accuracy
//! is fixed at 1.0 by the orchestrator; there is no conversion to validate.

use std::collections::BTreeMap;

use log::{debug, info};

use super::{audio, Pipeline, RunState, StageError, StageOutput};
use crate::channels::ChannelId;
use crate::engines::OnsetStats;
use crate::metadata::types::{ChannelAnalysis, FileKind, TimingStats};
use crate::notes::{self, NoteEvent};
use crate::storage;
use crate::tone;

/// Segments in a per-channel velocity curve.
const VELOCITY_CURVE_STEPS: usize = 12;

pub(crate) fn load_document(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let document = pipeline
        .engines()
        .loader
        .load_note_events(&state.source_path)?;
    debug!(
        "{}: {} tracks, {} events at {:.1} bpm",
        state.track,
        document.tracks.len(),
        document.total_events(),
        document.tempo_bpm
    );
    state.document = Some(document);
    Ok(StageOutput::default())
}

pub(crate) fn score_quality(
    _pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let document = state
        .document
        .as_ref()
        .ok_or_else(|| StageError::Other("no note-event document loaded".to_string()))?;
    let report = notes::structural_quality(document);
    debug!(
        "{}: structural quality {:.2} (velocity {:.2}, timing {:.2}, density {:.2})",
        state.track, report.score, report.velocity_spread, report.timing_humanization, report.density
    );
    let score = report.score;
    state.quality = Some(report);
    Ok(StageOutput::with_confidence(score))
}

pub(crate) fn analyze_channels(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let registry = pipeline.registry();
    let document = state
        .document
        .as_ref()
        .ok_or_else(|| StageError::Other("no note-event document loaded".to_string()))?;

    let mut grouped: BTreeMap<ChannelId, Vec<NoteEvent>> = BTreeMap::new();
    let mut unmapped = 0usize;
    for track in &document.tracks {
        match registry.map_program_to_channel(track.program, track.is_percussion) {
            Some(channel) => grouped
                .entry(channel)
                .or_default()
                .extend(track.events.iter().cloned()),
            None => {
                unmapped += 1;
                debug!(
                    "native channel {} (program {}) has no canonical home",
                    track.channel, track.program
                );
            }
        }
    }

    let tempo_bpm = document.tempo_bpm;
    let total_tracks = document.tracks.len();
    for (channel, events) in grouped {
        let Some(agent) = registry.get_agent(channel) else {
            continue;
        };
        let timing = notes::timing_stats(&events, tempo_bpm);
        let onsets = onset_stats(&events, tempo_bpm, &timing);
        let pattern = audio::classify_rhythmic_pattern(&onsets, tempo_bpm);

        let analysis = ChannelAnalysis {
            channel_id: channel,
            instrument_name: agent.instrument.to_string(),
            note_range: notes::note_range(&events),
            velocity_curve: notes::velocity_curve(&events, VELOCITY_CURVE_STEPS),
            timing_variation: timing,
            playing_pattern_tags: agent.playing_patterns.iter().map(|p| p.to_string()).collect(),
            harmonic_function: agent.harmonic_function.to_string(),
            interaction_strengths: registry
                .interactions_of(channel)
                .into_iter()
                .map(|(partner, kind)| (partner, kind.base_strength()))
                .collect(),
            behavioral_traits: agent
                .behavioral_traits
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            tone_profile: tone::unmeasured(agent.tone()),
            event_count: events.len(),
            dominant_rhythmic_pattern: pattern.to_string(),
        };
        state.record.add_channel_analysis(registry, analysis)?;
    }

    let mapped_share = if total_tracks == 0 {
        0.0
    } else {
        (total_tracks - unmapped) as f64 / total_tracks as f64
    };
    debug!(
        "{}: {}/{} tracks mapped onto canonical channels",
        state.track,
        total_tracks - unmapped,
        total_tracks
    );
    Ok(StageOutput::with_confidence(mapped_share))
}

pub(crate) fn standardize_document(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let (standardized, dropped, total_tracks) = {
        let document = state
            .document
            .as_ref()
            .ok_or_else(|| StageError::Other("no note-event document loaded".to_string()))?;
        let (standardized, dropped) = notes::standardize(document, pipeline.registry());
        (standardized, dropped, document.tracks.len())
    };
    if !dropped.is_empty() {
        debug!(
            "{}: dropped {} tracks without canonical channels (native {:?})",
            state.track,
            dropped.len(),
            dropped
        );
    }

    let path = storage::standardized_notes_path(&state.output_root, &state.track);
    storage::write_json(&path, &standardized)?;
    let record_id = state.record.id().to_string();
    state.record.add_file_reference(
        "standardized_notes",
        storage::file_reference(
            &record_id,
            "standardized_notes",
            FileKind::DerivedNoteEvents,
            &path,
        ),
    )?;
    info!(
        "{}: standardized {} of {} tracks",
        state.track,
        standardized.tracks.len(),
        total_tracks
    );
    state.document_path = Some(path);
    Ok(StageOutput::with_confidence(
        standardized.tracks.len() as f64 / total_tracks.max(1) as f64,
    ))
}

/// Onset statistics reconstructed from discrete events, so the riddim
/// classifier works on both branches.
fn onset_stats(events: &[NoteEvent], tempo_bpm: f64, timing: &TimingStats) -> OnsetStats {
    let duration = events
        .iter()
        .map(|e| e.start_secs + e.duration_secs)
        .fold(0.0f64, f64::max);
    let rate_hz = if duration > 0.0 {
        events.len() as f64 / duration
    } else {
        0.0
    };
    let offbeat_ratio = if tempo_bpm > 0.0 && !events.is_empty() {
        let beat = 60.0 / tempo_bpm;
        let offbeat = events
            .iter()
            .filter(|e| {
                let phase = (e.start_secs / beat).rem_euclid(1.0);
                (phase - 0.5).abs() < 0.125
            })
            .count();
        offbeat as f64 / events.len() as f64
    } else {
        0.0
    };
    OnsetStats {
        count: events.len(),
        rate_hz,
        mean_deviation_ms: timing.mean_deviation_ms,
        std_deviation_ms: timing.std_deviation_ms,
        ahead_ratio: timing.ahead_ratio,
        offbeat_ratio,
    }
}
