//! Audio-branch stages.
//!
//! Feature extraction is the one required stage; everything after it
//! degrades. Per-stem analysis resolves stem names through the channel
//! registry and blends measured tone into the instrument archetypes; the
//! interaction stage distills the per-channel analyses into relationship
//! and groove summaries plus training vectors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::{retention, Pipeline, RunState, StageError, StageOutput};
use crate::channels::{ChannelId, ChannelRegistry, InteractionType};
use crate::engines::{FeatureSet, OnsetStats, StemSeparation};
use crate::metadata::types::{
    ChannelAnalysis, FileKind, GrooveSummary, RelationshipSummary, TimingStats,
};
use crate::notes::{self, NoteEventDocument};
use crate::storage;
use crate::tone;
use crate::training;

pub(crate) fn extract_features(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let features = pipeline
        .engines()
        .features
        .extract_features(&state.source_path)?;
    debug!(
        "{}: {:.1} bpm, {} {}, {:.0}s",
        state.track, features.tempo.bpm, features.key.key, features.key.mode, features.duration_secs
    );
    let confidence = features.tempo.confidence;
    state.features = Some(features);
    Ok(StageOutput::with_confidence(confidence))
}

pub(crate) fn analyze_tone(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let measured = pipeline
        .engines()
        .tone
        .analyze_tone(&state.source_path, None)?;
    debug!(
        "{}: mix brightness {:.2}, {} tone segments",
        state.track,
        measured.brightness,
        measured.segments.len()
    );
    state.mix_tone = Some(measured);
    Ok(StageOutput::default())
}

pub(crate) fn separate_stems(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let out_dir = storage::stems_dir(&state.output_root, &state.track);
    let timeout_secs = pipeline.config().separation_timeout_secs;
    let stems = if timeout_secs == 0 {
        pipeline
            .engines()
            .stems
            .separate_stems(&state.source_path, &out_dir)?
    } else {
        separate_with_timeout(
            Arc::clone(&pipeline.engines().stems),
            state.source_path.clone(),
            out_dir,
            Duration::from_secs(timeout_secs),
        )?
    };
    info!("{}: {} stems isolated", state.track, stems.len());

    let record_id = state.record.id().to_string();
    for (name, path) in &stems {
        let role = format!("stem_{name}");
        state.record.add_file_reference(
            &role,
            storage::file_reference(&record_id, &role, FileKind::DerivedStem, path),
        )?;
    }
    state.stems = stems;
    Ok(StageOutput::default())
}

/// Run separation on a worker thread and give up after `timeout`. The
/// worker is left to finish in the background; an abandoned result is
/// dropped with the channel.
fn separate_with_timeout(
    engine: Arc<dyn StemSeparation>,
    source: PathBuf,
    out_dir: PathBuf,
    timeout: Duration,
) -> Result<BTreeMap<String, PathBuf>, StageError> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(engine.separate_stems(&source, &out_dir));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => Ok(result?),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(StageError::Timeout(timeout.as_secs())),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(StageError::Other(
            "separation worker exited without a result".to_string(),
        )),
    }
}

pub(crate) fn analyze_stems(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let registry = pipeline.registry();
    let total = state.stems.len();
    let mut mapped = 0usize;

    for (stem_name, stem_path) in &state.stems {
        let Some(channel) = registry.map_stem_name_to_channel(stem_name) else {
            debug!("stem '{stem_name}' has no canonical channel, skipping");
            continue;
        };
        if state.record.channel_analyses().contains_key(&channel) {
            debug!("channel {channel} already analyzed, skipping stem '{stem_name}'");
            continue;
        }
        let Some(agent) = registry.get_agent(channel) else {
            continue;
        };

        let stem_features = match pipeline.engines().features.extract_features(stem_path) {
            Ok(features) => Some(features),
            Err(err) => {
                warn!("{}: no per-stem features for '{stem_name}': {err}", state.track);
                None
            }
        };
        let measured = match pipeline
            .engines()
            .tone
            .analyze_tone(stem_path, Some(agent.instrument))
        {
            Ok(measured) => Some(measured),
            Err(err) => {
                debug!("stem '{stem_name}' tone falls back to the mix measurement: {err}");
                state.mix_tone.clone()
            }
        };
        let tone_profile = match &measured {
            Some(m) => tone::adapt(agent.tone(), m),
            None => tone::unmeasured(agent.tone()),
        };

        let (note_range, velocity_curve, timing_variation, pattern) = match &stem_features {
            Some(f) => (
                (f.pitch.low_note, f.pitch.high_note),
                f.energy
                    .segment_rms
                    .iter()
                    .map(|rms| (rms * 127.0).round().clamp(0.0, 127.0) as u8)
                    .collect(),
                TimingStats {
                    mean_deviation_ms: f.onsets.mean_deviation_ms,
                    std_deviation_ms: f.onsets.std_deviation_ms,
                    ahead_ratio: f.onsets.ahead_ratio,
                },
                classify_rhythmic_pattern(&f.onsets, f.tempo.bpm),
            ),
            None => (
                agent.note_range,
                Vec::new(),
                TimingStats {
                    mean_deviation_ms: agent.timing_variation * 1000.0,
                    std_deviation_ms: 0.0,
                    ahead_ratio: 0.5,
                },
                "unknown",
            ),
        };

        let analysis = ChannelAnalysis {
            channel_id: channel,
            instrument_name: agent.instrument.to_string(),
            note_range,
            velocity_curve,
            timing_variation,
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
            tone_profile,
            event_count: 0,
            dominant_rhythmic_pattern: pattern.to_string(),
        };
        state.record.add_channel_analysis(registry, analysis)?;
        mapped += 1;
    }

    debug!("{}: {mapped}/{total} stems analyzed", state.track);
    Ok(StageOutput::with_confidence(mapped as f64 / total as f64))
}

pub(crate) fn convert_notes(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    let features = state
        .features
        .as_ref()
        .ok_or_else(|| StageError::Other("no feature set available".to_string()))?;
    let (document, reported) = pipeline
        .engines()
        .conversion
        .convert_to_note_events(&state.source_path, features)?;
    let agreement = super::tempo_agreement(features.tempo.bpm, document.tempo_bpm);
    let revised = super::refine_accuracy(reported, features.tempo.bpm, document.tempo_bpm);
    info!(
        "{}: conversion accuracy {reported:.3}, tempo agreement {agreement:.3}, revised {revised:.3}",
        state.track
    );

    let path = storage::converted_notes_path(&state.output_root, &state.track);
    storage::write_json(&path, &document)?;
    let record_id = state.record.id().to_string();
    state.record.add_file_reference(
        "converted_notes",
        storage::file_reference(&record_id, "converted_notes", FileKind::DerivedNoteEvents, &path),
    )?;
    state
        .record
        .fill_event_counts(&notes::channel_event_counts(&document, pipeline.registry()));

    state.accuracy = Some(revised);
    state.document_path = Some(path);
    state.document = Some(document);
    Ok(StageOutput::scored(revised, agreement))
}

pub(crate) fn analyze_interactions(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    if state.record.channel_analyses().len() < 2 {
        debug!(
            "{}: fewer than two channels analyzed, nothing to correlate",
            state.track
        );
        return Ok(StageOutput::default());
    }
    let features = state
        .features
        .as_ref()
        .ok_or_else(|| StageError::Other("no feature set available".to_string()))?;

    let relationship = relationship_summary(
        pipeline.registry(),
        state.record.channel_analyses(),
        features,
    );
    let groove = groove_summary(state.record.channel_analyses(), features, state.document.as_ref());
    let training = training::build_features(state.record.channel_analyses(), Some(&groove));
    let pocket = relationship.groove_pocket;

    state.record.set_relationship_summary(relationship)?;
    state.record.set_groove_summary(groove)?;
    state.record.set_training_features(training)?;
    Ok(StageOutput::with_confidence(pocket))
}

pub(crate) fn cleanup_stems(
    pipeline: &Pipeline,
    state: &mut RunState,
) -> Result<StageOutput, StageError> {
    if !retention::should_delete_stems(state.accuracy, !state.stems.is_empty()) {
        debug!(
            "{}: retention gate not met (accuracy {:?}), keeping {} stems",
            state.track,
            state.accuracy,
            state.stems.len()
        );
        return Ok(StageOutput::default());
    }
    if pipeline.config().keep_stems {
        info!(
            "{}: validation passed but keep_stems is set, keeping stems",
            state.track
        );
        return Ok(StageOutput::default());
    }
    let stems_dir = storage::stems_dir(&state.output_root, &state.track);
    let deleted = retention::delete_stem_files(&state.stems, &stems_dir);
    info!("{}: reclaimed {deleted} validated stems", state.track);
    state.stems_deleted = true;
    Ok(StageOutput::default())
}

// ── Riddim classification ───────────────────────────────────────────────────
// Onset density relative to the tempo decides the family: sparse playing
// with the emphasis off the downbeat is a one drop; a driving subdivision is
// rockers; four-on-the-floor density without offbeat emphasis is steppers.
pub fn classify_rhythmic_pattern(onsets: &OnsetStats, tempo_bpm: f64) -> &'static str {
    if tempo_bpm <= 0.0 || onsets.count == 0 {
        return "unknown";
    }
    let per_beat = onsets.rate_hz * 60.0 / tempo_bpm;
    if onsets.offbeat_ratio < 0.45 && per_beat >= 1.5 {
        "steppers"
    } else if per_beat >= 2.5 {
        "rockers"
    } else {
        "one_drop"
    }
}

// ── Relationship heuristics (0-1) ───────────────────────────────────────────
// bass_drum_lock starts at the registry's locked-to strength and decays as
// the two channels' mean grid deviations drift apart; 50 ms of drift costs
// the full 40% modulation. harmonic_coherence is 0.3 floor + 0.5 × the share
// of analyzed pairs the registry relates + 0.2 × key confidence.
// groove_pocket wants a tight onset spread (70%) and an ahead ratio near the
// laid-back 0.35 sweet spot (30%).
pub(crate) fn relationship_summary(
    registry: &ChannelRegistry,
    analyses: &BTreeMap<ChannelId, ChannelAnalysis>,
    features: &FeatureSet,
) -> RelationshipSummary {
    let bass_drum_lock = match (analyses.get(&ChannelId::BASS), analyses.get(&ChannelId::DRUMS)) {
        (Some(bass), Some(drums)) => {
            let base = registry
                .interaction_between(ChannelId::BASS, ChannelId::DRUMS)
                .map(|kind| kind.base_strength())
                .unwrap_or(0.5);
            let drift_ms = (bass.timing_variation.mean_deviation_ms
                - drums.timing_variation.mean_deviation_ms)
                .abs();
            (base * (1.0 - (drift_ms / 50.0).clamp(0.0, 1.0) * 0.4)).clamp(0.0, 1.0)
        }
        _ => 0.0,
    };

    let channels: Vec<ChannelId> = analyses.keys().copied().collect();
    let mut related_pairs = 0usize;
    let mut total_pairs = 0usize;
    for (i, &a) in channels.iter().enumerate() {
        for &b in &channels[i + 1..] {
            total_pairs += 1;
            if registry.interaction_between(a, b).is_some()
                || registry.interaction_between(b, a).is_some()
            {
                related_pairs += 1;
            }
        }
    }
    let related_share = if total_pairs == 0 {
        0.0
    } else {
        related_pairs as f64 / total_pairs as f64
    };
    let harmonic_coherence =
        (0.3 + 0.5 * related_share + 0.2 * features.key.confidence).clamp(0.0, 1.0);

    let per_beat = if features.tempo.bpm > 0.0 {
        features.onsets.rate_hz * 60.0 / features.tempo.bpm
    } else {
        0.0
    };
    let rhythmic_subdivision = if per_beat < 1.75 {
        "quarter_note"
    } else if per_beat < 3.0 {
        "eighth_note"
    } else {
        "sixteenth_note"
    }
    .to_string();

    let spread = (1.0 - features.onsets.std_deviation_ms / 50.0).clamp(0.0, 1.0);
    let feel = (1.0 - (features.onsets.ahead_ratio - 0.35).abs()).clamp(0.0, 1.0);
    let groove_pocket = (spread * 0.7 + feel * 0.3).clamp(0.0, 1.0);

    let mut dynamic_correlation = BTreeMap::new();
    for (i, &a) in channels.iter().enumerate() {
        for &b in &channels[i + 1..] {
            let (Some(left), Some(right)) = (analyses.get(&a), analyses.get(&b)) else {
                continue;
            };
            if let Some(r) = pearson(&left.velocity_curve, &right.velocity_curve) {
                dynamic_correlation.insert(
                    format!("{}_{}", left.instrument_name, right.instrument_name),
                    r,
                );
            }
        }
    }

    let mut call_response_pairs = Vec::new();
    for &a in &channels {
        for &b in &channels {
            if a != b
                && matches!(
                    registry.interaction_between(a, b),
                    Some(InteractionType::CallsAndRespondsWith)
                )
            {
                call_response_pairs.push((a, b));
            }
        }
    }

    RelationshipSummary {
        bass_drum_lock,
        harmonic_coherence,
        rhythmic_subdivision,
        groove_pocket,
        dynamic_correlation,
        call_response_pairs,
    }
}

pub(crate) fn groove_summary(
    analyses: &BTreeMap<ChannelId, ChannelAnalysis>,
    features: &FeatureSet,
    document: Option<&NoteEventDocument>,
) -> GrooveSummary {
    let style_tag = analyses
        .get(&ChannelId::DRUMS)
        .map(|drums| drums.dominant_rhythmic_pattern.clone())
        .filter(|tag| tag != "unknown")
        .unwrap_or_else(|| classify_rhythmic_pattern(&features.onsets, features.tempo.bpm).to_string());
    let time_signature = document
        .map(|doc| format!("{}/{}", doc.time_signature.0, doc.time_signature.1))
        .unwrap_or_else(|| "4/4".to_string());

    // One bar of per-beat grid offsets, positive = behind the beat. Beat
    // three carries the drop, so it leans hardest.
    let lag =
        features.onsets.mean_deviation_ms / 1000.0 * (1.0 - 2.0 * features.onsets.ahead_ratio);
    let micro_timing = vec![lag * 0.8, lag, lag * 1.2, lag];

    let harmonic_rhythm = if features.tempo.bpm > 0.0 {
        // Chord motion estimate: a quarter of the per-beat onset density,
        // clamped to the 0.25-4 changes/bar a band actually plays.
        (features.onsets.rate_hz * 60.0 / features.tempo.bpm / 4.0).clamp(0.25, 4.0)
    } else {
        1.0
    };

    GrooveSummary {
        style_tag,
        tempo_bpm: features.tempo.bpm,
        // The tempo estimator's own confidence is the best stability signal
        // available at this boundary.
        tempo_stability: features.tempo.confidence.clamp(0.0, 1.0),
        key: features.key.key.clone(),
        mode: features.key.mode.clone(),
        time_signature,
        micro_timing,
        dynamic_arc: features.energy.segment_rms.clone(),
        section_labels: features.sections.iter().map(|s| s.label.clone()).collect(),
        harmonic_rhythm,
    }
}

fn pearson(a: &[u8], b: &[u8]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let mean_a = a[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] as f64 - mean_a;
        let db = b[i] as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}
