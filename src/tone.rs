//! Instrument tone profiles.
//!
//! Every canonical instrument carries a hand-calibrated tone archetype
//! (color descriptors plus spectral scalars). When a recording is analyzed,
//! the measured values are blended into the archetype with fixed per-attribute
//! weights, so one noisy measurement can shade a profile but never replace it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Frequency-band vocabulary shared by tone analysis and harmonic content maps.
/// Ordered low to high; the Hz ranges are the conventional mixing bands.
pub const FREQUENCY_BANDS: &[(&str, (u32, u32))] = &[
    ("sub_bass", (20, 60)),
    ("bass", (60, 250)),
    ("low_mid", (250, 500)),
    ("mid", (500, 2000)),
    ("high_mid", (2000, 4000)),
    ("presence", (4000, 8000)),
    ("brilliance", (8000, 20000)),
];

// Per-attribute blend weights: fraction moved from the archetype toward the
// measured value. Calibrated so attack responds fastest (playing technique
// varies most between recordings) and weight slowest (instrument mass is
// mostly an instrument property, not a recording property).
const BLEND_BRIGHTNESS: f64 = 0.30;
const BLEND_WEIGHT: f64 = 0.20;
const BLEND_RESONANCE: f64 = 0.20;
const BLEND_ATTACK: f64 = 0.40;
const BLEND_HARMONIC: f64 = 0.30;

/// Tone archetype for one instrument. Static data; scalars are in [0, 1].
#[derive(Debug, Clone)]
pub struct ToneArchetype {
    pub primary_color: &'static str,
    pub secondary_color: &'static str,
    pub texture: &'static str,
    pub brightness: f64,
    pub weight: f64,
    pub resonance: f64,
    pub attack_sharpness: f64,
    pub decay_rate: f64,
    pub dynamic_range: f64,
    /// Baseline band energies, indexed in [`FREQUENCY_BANDS`] order.
    pub band_profile: [f64; 7],
}

/// Tone measurements taken from an actual recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasuredTone {
    /// Normalized spectral centroid.
    pub brightness: f64,
    /// Normalized RMS energy.
    pub energy: f64,
    /// Spectral flatness (1.0 = noise-like, 0.0 = tonal).
    pub flatness: f64,
    pub attack_sharpness: f64,
    /// Measured energy per frequency band (keys from [`FREQUENCY_BANDS`]).
    pub band_energy: BTreeMap<String, f64>,
    /// Per-segment evolution over the recording.
    pub segments: Vec<ToneSnapshot>,
}

/// One time slice of a recording's tone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneSnapshot {
    pub start_secs: f64,
    pub end_secs: f64,
    pub brightness: f64,
    pub energy: f64,
}

/// Adapted tone descriptor attached to channel analyses and agent exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneProfile {
    pub primary_descriptor: String,
    pub secondary_descriptor: String,
    pub texture_label: String,
    pub brightness: f64,
    pub weight: f64,
    pub resonance: f64,
    pub attack_sharpness: f64,
    /// Energy per frequency band, keyed by [`FREQUENCY_BANDS`] names.
    pub harmonic_content: BTreeMap<String, f64>,
    /// Ordered per-segment snapshots; empty when no measurement was available.
    pub time_series: Vec<ToneSnapshot>,
}

impl ToneProfile {
    /// True when the profile carries actual descriptors (all archetypes do).
    pub fn is_populated(&self) -> bool {
        !self.primary_descriptor.is_empty() && !self.texture_label.is_empty()
    }
}

/// Neutral archetype for instruments without a dedicated entry.
pub static DEFAULT_ARCHETYPE: ToneArchetype = ToneArchetype {
    primary_color: "grey",
    secondary_color: "white",
    texture: "neutral",
    brightness: 0.5,
    weight: 0.5,
    resonance: 0.5,
    attack_sharpness: 0.5,
    decay_rate: 0.5,
    dynamic_range: 0.5,
    band_profile: [0.3, 0.4, 0.5, 0.5, 0.4, 0.3, 0.2],
};

/// Look up the tone archetype for a canonical instrument name.
pub fn archetype(instrument: &str) -> Option<&'static ToneArchetype> {
    ARCHETYPES
        .iter()
        .find(|(name, _)| *name == instrument)
        .map(|(_, profile)| profile)
}

/// Total lookup: unknown instruments get the neutral archetype.
pub fn archetype_or_default(instrument: &str) -> &'static ToneArchetype {
    archetype(instrument).unwrap_or(&DEFAULT_ARCHETYPE)
}

/// Blend toward the archetype with the fixed per-attribute weights.
/// Labels are inherited unchanged; scalars move partway toward the measurement.
pub fn adapt(base: &ToneArchetype, measured: &MeasuredTone) -> ToneProfile {
    let mut harmonic_content = base_band_map(base);
    for (band, energy) in harmonic_content.iter_mut() {
        if let Some(m) = measured.band_energy.get(band.as_str()) {
            *energy = blend(*energy, *m, BLEND_HARMONIC);
        }
    }

    ToneProfile {
        primary_descriptor: base.primary_color.to_string(),
        secondary_descriptor: base.secondary_color.to_string(),
        texture_label: base.texture.to_string(),
        brightness: blend(base.brightness, measured.brightness, BLEND_BRIGHTNESS),
        weight: blend(base.weight, measured.energy, BLEND_WEIGHT),
        // Flat spectra ring less: resonance tracks the inverse of flatness.
        resonance: blend(base.resonance, 1.0 - measured.flatness, BLEND_RESONANCE),
        attack_sharpness: blend(base.attack_sharpness, measured.attack_sharpness, BLEND_ATTACK),
        harmonic_content,
        time_series: measured.segments.clone(),
    }
}

/// Archetype rendered as a profile without any measurement (fallback when tone
/// analysis failed or was skipped).
pub fn unmeasured(base: &ToneArchetype) -> ToneProfile {
    ToneProfile {
        primary_descriptor: base.primary_color.to_string(),
        secondary_descriptor: base.secondary_color.to_string(),
        texture_label: base.texture.to_string(),
        brightness: base.brightness,
        weight: base.weight,
        resonance: base.resonance,
        attack_sharpness: base.attack_sharpness,
        harmonic_content: base_band_map(base),
        time_series: Vec::new(),
    }
}

fn base_band_map(base: &ToneArchetype) -> BTreeMap<String, f64> {
    FREQUENCY_BANDS
        .iter()
        .zip(base.band_profile.iter())
        .map(|((name, _), energy)| (name.to_string(), *energy))
        .collect()
}

fn blend(base: f64, measured: f64, weight: f64) -> f64 {
    (base * (1.0 - weight) + measured * weight).clamp(0.0, 1.0)
}

// Calibrated archetypes for the session instruments. Colors follow the
// spectrum-chart convention (low/heavy instruments toward blue, bright
// instruments toward yellow); band profiles are baseline energy per band.
const ARCHETYPES: &[(&str, ToneArchetype)] = &[
    (
        "bass",
        ToneArchetype {
            primary_color: "blue",
            secondary_color: "grey",
            texture: "dark",
            brightness: 0.20,
            weight: 0.85,
            resonance: 0.80,
            attack_sharpness: 0.30,
            decay_rate: 0.40,
            dynamic_range: 0.70,
            band_profile: [0.85, 0.90, 0.50, 0.25, 0.10, 0.05, 0.02],
        },
    ),
    (
        "drums",
        ToneArchetype {
            primary_color: "white",
            secondary_color: "black",
            texture: "percussive",
            brightness: 0.60,
            weight: 0.70,
            resonance: 0.30,
            attack_sharpness: 1.00,
            decay_rate: 0.85,
            dynamic_range: 1.00,
            band_profile: [0.60, 0.70, 0.50, 0.50, 0.55, 0.60, 0.50],
        },
    ),
    (
        "rhythm_guitar",
        ToneArchetype {
            primary_color: "tan",
            secondary_color: "brown",
            texture: "warm",
            brightness: 0.40,
            weight: 0.60,
            resonance: 0.60,
            attack_sharpness: 0.80,
            decay_rate: 0.90,
            dynamic_range: 0.60,
            band_profile: [0.05, 0.30, 0.60, 0.75, 0.50, 0.30, 0.10],
        },
    ),
    (
        "lead_guitar",
        ToneArchetype {
            primary_color: "grey",
            secondary_color: "yellow",
            texture: "bright",
            brightness: 0.70,
            weight: 0.40,
            resonance: 0.55,
            attack_sharpness: 0.70,
            decay_rate: 0.50,
            dynamic_range: 0.65,
            band_profile: [0.02, 0.15, 0.40, 0.70, 0.75, 0.60, 0.30],
        },
    ),
    (
        "organ",
        ToneArchetype {
            primary_color: "ivory",
            secondary_color: "yellow",
            texture: "hollow",
            brightness: 0.50,
            weight: 0.55,
            resonance: 0.90,
            attack_sharpness: 0.20,
            decay_rate: 0.10,
            dynamic_range: 0.40,
            band_profile: [0.10, 0.45, 0.70, 0.80, 0.50, 0.25, 0.10],
        },
    ),
    (
        "piano",
        ToneArchetype {
            primary_color: "white",
            secondary_color: "grey",
            texture: "neutral",
            brightness: 0.50,
            weight: 0.50,
            resonance: 0.50,
            attack_sharpness: 0.60,
            decay_rate: 0.50,
            dynamic_range: 0.80,
            band_profile: [0.08, 0.35, 0.60, 0.70, 0.55, 0.35, 0.15],
        },
    ),
    (
        "clavinet",
        ToneArchetype {
            primary_color: "brown",
            secondary_color: "red",
            texture: "biting",
            brightness: 0.65,
            weight: 0.45,
            resonance: 0.40,
            attack_sharpness: 0.90,
            decay_rate: 0.60,
            dynamic_range: 0.55,
            band_profile: [0.03, 0.25, 0.55, 0.80, 0.70, 0.50, 0.20],
        },
    ),
    (
        "percussion",
        ToneArchetype {
            primary_color: "red",
            secondary_color: "white",
            texture: "crisp",
            brightness: 0.75,
            weight: 0.35,
            resonance: 0.25,
            attack_sharpness: 0.95,
            decay_rate: 0.80,
            dynamic_range: 0.90,
            band_profile: [0.05, 0.20, 0.35, 0.50, 0.70, 0.80, 0.60],
        },
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn measured() -> MeasuredTone {
        MeasuredTone {
            brightness: 0.9,
            energy: 0.2,
            flatness: 0.5,
            attack_sharpness: 0.8,
            band_energy: BTreeMap::from([("bass".to_string(), 0.4)]),
            segments: vec![ToneSnapshot {
                start_secs: 0.0,
                end_secs: 2.0,
                brightness: 0.9,
                energy: 0.2,
            }],
        }
    }

    #[test]
    fn every_archetype_has_descriptors_and_bands() {
        for (name, base) in ARCHETYPES {
            assert!(!base.primary_color.is_empty(), "{name} missing color");
            assert!(!base.texture.is_empty(), "{name} missing texture");
            assert_eq!(base.band_profile.len(), FREQUENCY_BANDS.len());
            for energy in base.band_profile {
                assert!((0.0..=1.0).contains(&energy), "{name} band out of range");
            }
        }
    }

    #[test]
    fn archetype_lookup() {
        assert!(archetype("bass").is_some());
        assert!(archetype("organ").is_some());
        assert!(archetype("theremin").is_none());
    }

    #[test]
    fn adapt_inherits_labels_unchanged() {
        let base = archetype("bass").unwrap();
        let profile = adapt(base, &measured());
        assert_eq!(profile.primary_descriptor, "blue");
        assert_eq!(profile.secondary_descriptor, "grey");
        assert_eq!(profile.texture_label, "dark");
    }

    #[test]
    fn adapt_moves_brightness_30_percent_toward_measured() {
        let base = archetype("bass").unwrap();
        let profile = adapt(base, &measured());
        // 0.20 + 0.30 * (0.90 - 0.20) = 0.41
        assert!((profile.brightness - 0.41).abs() < 1e-12);
    }

    #[test]
    fn adapt_moves_weight_20_percent_toward_energy() {
        let base = archetype("bass").unwrap();
        let profile = adapt(base, &measured());
        // 0.85 + 0.20 * (0.20 - 0.85) = 0.72
        assert!((profile.weight - 0.72).abs() < 1e-12);
    }

    #[test]
    fn adapt_blends_only_measured_bands() {
        let base = archetype("bass").unwrap();
        let profile = adapt(base, &measured());
        // bass band measured at 0.4: 0.90 + 0.30 * (0.40 - 0.90) = 0.75
        assert!((profile.harmonic_content["bass"] - 0.75).abs() < 1e-12);
        // sub_bass had no measurement, stays at baseline
        assert!((profile.harmonic_content["sub_bass"] - 0.85).abs() < 1e-12);
    }

    #[test]
    fn adapt_carries_time_series() {
        let base = archetype("drums").unwrap();
        let profile = adapt(base, &measured());
        assert_eq!(profile.time_series.len(), 1);
    }

    #[test]
    fn blend_is_clamped() {
        assert_eq!(blend(0.9, 5.0, 0.5), 1.0);
        assert_eq!(blend(0.1, -3.0, 0.5), 0.0);
    }

    #[test]
    fn unmeasured_profile_keeps_baseline_and_empty_series() {
        let base = archetype("organ").unwrap();
        let profile = unmeasured(base);
        assert!(profile.is_populated());
        assert_eq!(profile.brightness, base.brightness);
        assert_eq!(profile.harmonic_content.len(), FREQUENCY_BANDS.len());
        assert!(profile.time_series.is_empty());
    }

    #[test]
    fn unknown_instrument_falls_back_to_neutral() {
        let base = archetype_or_default("kazoo");
        assert_eq!(base.texture, "neutral");
        assert_eq!(base.brightness, 0.5);
    }
}
