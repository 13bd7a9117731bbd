//! Training-feature assembly.
//!
//! Flattens the per-channel analyses and the groove summary into plain
//! numeric vectors a downstream model consumer can ingest without knowing
//! the record structure. Vector layouts are stable: tone is four scalars
//! plus the band energies in band-table order, rhythm is the timing triple
//! plus event count plus the normalized velocity curve.

use std::collections::BTreeMap;

use crate::channels::ChannelId;
use crate::metadata::types::{ChannelAnalysis, GrooveSummary, TrainingFeatures};
use crate::tone::{self, ToneProfile, FREQUENCY_BANDS};

pub fn build_features(
    analyses: &BTreeMap<ChannelId, ChannelAnalysis>,
    groove: Option<&GrooveSummary>,
) -> TrainingFeatures {
    let mut tone_vectors = BTreeMap::new();
    let mut behavior_vectors = BTreeMap::new();
    let mut rhythm_vectors = BTreeMap::new();
    let mut interaction_matrix = Vec::new();

    for (&channel, analysis) in analyses {
        tone_vectors.insert(channel, tone_vector(&analysis.tone_profile));
        behavior_vectors.insert(channel, behavior_vector(analysis));
        rhythm_vectors.insert(channel, rhythm_vector(analysis));
        for (&partner, &strength) in &analysis.interaction_strengths {
            interaction_matrix.push((channel, partner, strength));
        }
    }

    TrainingFeatures {
        tone_vectors,
        behavior_vectors,
        rhythm_vectors,
        interaction_matrix,
        groove_context: groove.map(groove_vector).unwrap_or_default(),
    }
}

fn tone_vector(profile: &ToneProfile) -> Vec<f64> {
    let mut vector = vec![
        profile.brightness,
        profile.weight,
        profile.resonance,
        profile.attack_sharpness,
    ];
    for &(band, _) in FREQUENCY_BANDS {
        vector.push(*profile.harmonic_content.get(band).unwrap_or(&0.0));
    }
    vector
}

/// Trait weights in name order, then the archetype's decay and dynamic
/// range (stable per instrument, not carried on the profile).
fn behavior_vector(analysis: &ChannelAnalysis) -> Vec<f64> {
    let mut vector: Vec<f64> = analysis.behavioral_traits.values().copied().collect();
    let archetype = tone::archetype_or_default(&analysis.instrument_name);
    vector.push(archetype.decay_rate);
    vector.push(archetype.dynamic_range);
    vector
}

fn rhythm_vector(analysis: &ChannelAnalysis) -> Vec<f64> {
    let mut vector = vec![
        analysis.timing_variation.mean_deviation_ms,
        analysis.timing_variation.std_deviation_ms,
        analysis.timing_variation.ahead_ratio,
        analysis.event_count as f64,
    ];
    vector.extend(
        analysis
            .velocity_curve
            .iter()
            .map(|&step| step as f64 / 127.0),
    );
    vector
}

fn groove_vector(groove: &GrooveSummary) -> Vec<f64> {
    vec![
        groove.tempo_bpm,
        groove.tempo_stability,
        groove.harmonic_rhythm,
        style_code(&groove.style_tag),
    ]
}

/// Stable numeric encoding of the riddim family.
fn style_code(tag: &str) -> f64 {
    match tag {
        "one_drop" => 0.0,
        "rockers" => 1.0,
        "steppers" => 2.0,
        _ => 3.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::types::TimingStats;

    fn analysis(channel: ChannelId, instrument: &str) -> ChannelAnalysis {
        let mut traits = BTreeMap::new();
        traits.insert("aggression".to_string(), 0.3);
        traits.insert("consistency".to_string(), 0.9);
        let mut strengths = BTreeMap::new();
        strengths.insert(ChannelId::DRUMS, 0.95);

        ChannelAnalysis {
            channel_id: channel,
            instrument_name: instrument.to_string(),
            note_range: (28, 55),
            velocity_curve: vec![64, 96],
            timing_variation: TimingStats {
                mean_deviation_ms: 8.0,
                std_deviation_ms: 3.0,
                ahead_ratio: 0.4,
            },
            playing_pattern_tags: Vec::new(),
            harmonic_function: "root".to_string(),
            interaction_strengths: strengths,
            behavioral_traits: traits,
            tone_profile: tone::unmeasured(tone::archetype_or_default(instrument)),
            event_count: 56,
            dominant_rhythmic_pattern: "one_drop".to_string(),
        }
    }

    fn groove() -> GrooveSummary {
        GrooveSummary {
            style_tag: "rockers".to_string(),
            tempo_bpm: 80.0,
            tempo_stability: 0.9,
            key: "A".to_string(),
            mode: "minor".to_string(),
            time_signature: "4/4".to_string(),
            micro_timing: vec![0.001, 0.002, 0.003, 0.002],
            dynamic_arc: vec![0.2, 0.4],
            section_labels: Vec::new(),
            harmonic_rhythm: 0.5,
        }
    }

    #[test]
    fn vectors_cover_every_analyzed_channel() {
        let mut analyses = BTreeMap::new();
        analyses.insert(ChannelId::BASS, analysis(ChannelId::BASS, "bass"));
        analyses.insert(ChannelId::DRUMS, analysis(ChannelId::DRUMS, "drums"));

        let groove = groove();
        let features = build_features(&analyses, Some(&groove));
        assert_eq!(features.tone_vectors.len(), 2);
        assert_eq!(features.behavior_vectors.len(), 2);
        assert_eq!(features.rhythm_vectors.len(), 2);

        // Four scalars plus one slot per frequency band.
        let tone = &features.tone_vectors[&ChannelId::BASS];
        assert_eq!(tone.len(), 4 + FREQUENCY_BANDS.len());
        let bass = tone::archetype_or_default("bass");
        assert_eq!(tone[0], bass.brightness);

        // Two traits plus decay and dynamic range.
        let behavior = &features.behavior_vectors[&ChannelId::BASS];
        assert_eq!(behavior.len(), 4);
        assert_eq!(behavior[0], 0.3);
        assert_eq!(behavior[2], bass.decay_rate);

        // Timing triple, event count, then the normalized curve.
        let rhythm = &features.rhythm_vectors[&ChannelId::BASS];
        assert_eq!(rhythm.len(), 4 + 2);
        assert_eq!(rhythm[3], 56.0);
        assert!((rhythm[4] - 64.0 / 127.0).abs() < 1e-12);
    }

    #[test]
    fn interaction_matrix_flattens_strengths() {
        let mut analyses = BTreeMap::new();
        analyses.insert(ChannelId::BASS, analysis(ChannelId::BASS, "bass"));
        let features = build_features(&analyses, None);
        assert_eq!(
            features.interaction_matrix,
            vec![(ChannelId::BASS, ChannelId::DRUMS, 0.95)]
        );
    }

    #[test]
    fn groove_context_encodes_the_style() {
        let groove = groove();
        let features = build_features(&BTreeMap::new(), Some(&groove));
        assert_eq!(features.groove_context, vec![80.0, 0.9, 0.5, 1.0]);

        let without = build_features(&BTreeMap::new(), None);
        assert!(without.groove_context.is_empty());
    }
}
