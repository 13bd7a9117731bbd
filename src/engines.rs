//! Analysis-engine boundary.
//!
//! The pipeline consumes five collaborator contracts: feature extraction,
//! stem separation, tone analysis, note-event conversion and note-event
//! loading. Real DSP/ML implementations live behind these traits; this
//! module ships deterministic mock engines that derive every value from a
//! SHA-256 hash of the input path, so runs are reproducible and tests need
//! no fixtures. The binary wires the mocks by default and says so at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::notes::{NoteEvent, NoteEventDocument, NoteTrack};
use crate::tone::{self, MeasuredTone, ToneSnapshot, FREQUENCY_BANDS};

#[derive(Debug, Error)]
pub enum FeatureExtractionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("feature engine failed: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum StemSeparationError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("separation engine failed: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
#[error("tone analysis failed: {0}")]
pub struct ToneAnalysisError(pub String);

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("conversion engine failed: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum NoteLoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("note-event file malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoEstimate {
    pub bpm: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEstimate {
    pub key: String,
    pub mode: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub start_secs: f64,
    pub end_secs: f64,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnsetStats {
    pub count: usize,
    pub rate_hz: f64,
    pub mean_deviation_ms: f64,
    pub std_deviation_ms: f64,
    /// Fraction of onsets ahead of the beat.
    pub ahead_ratio: f64,
    /// Fraction of onsets on offbeats. High for skank-driven material.
    pub offbeat_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyStats {
    pub rms_mean: f64,
    pub rms_std: f64,
    pub dynamic_range: f64,
    /// Coarse energy envelope, one value per segment.
    pub segment_rms: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralSummary {
    /// Normalized spectral centroid.
    pub brightness: f64,
    pub flatness: f64,
    pub attack_sharpness: f64,
    pub band_energy: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PitchStats {
    pub low_note: u8,
    pub high_note: u8,
    pub dominant_note: u8,
}

/// Everything the comprehensive extraction stage learns about a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub tempo: TempoEstimate,
    pub key: KeyEstimate,
    pub sections: Vec<Section>,
    pub onsets: OnsetStats,
    pub energy: EnergyStats,
    pub spectral: SpectralSummary,
    pub pitch: PitchStats,
}

pub trait FeatureExtraction: Send + Sync {
    fn extract_features(&self, path: &Path) -> Result<FeatureSet, FeatureExtractionError>;
}

pub trait StemSeparation: Send + Sync {
    /// Split a mix into named stems under `out_dir`. The returned map may be
    /// partial; callers treat every entry independently.
    fn separate_stems(
        &self,
        path: &Path,
        out_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, StemSeparationError>;
}

pub trait ToneAnalysis: Send + Sync {
    fn analyze_tone(
        &self,
        path: &Path,
        instrument_hint: Option<&str>,
    ) -> Result<MeasuredTone, ToneAnalysisError>;
}

pub trait NoteConversion: Send + Sync {
    /// Transcribe audio into a note-event document plus an accuracy estimate
    /// in [0, 1].
    fn convert_to_note_events(
        &self,
        path: &Path,
        features: &FeatureSet,
    ) -> Result<(NoteEventDocument, f64), ConversionError>;
}

pub trait NoteLoading: Send + Sync {
    fn load_note_events(&self, path: &Path) -> Result<NoteEventDocument, NoteLoadError>;
}

/// The engine handles one pipeline instance works with. Cheap to clone and
/// safe to share across worker threads.
#[derive(Clone)]
pub struct Engines {
    pub features: Arc<dyn FeatureExtraction>,
    pub stems: Arc<dyn StemSeparation>,
    pub tone: Arc<dyn ToneAnalysis>,
    pub conversion: Arc<dyn NoteConversion>,
    pub loader: Arc<dyn NoteLoading>,
}

impl Engines {
    /// The deterministic mock set with default knobs.
    pub fn mock() -> Self {
        Engines {
            features: Arc::new(MockFeatureEngine::default()),
            stems: Arc::new(MockStemEngine::default()),
            tone: Arc::new(MockToneEngine::default()),
            conversion: Arc::new(MockConversionEngine::default()),
            loader: Arc::new(MockNoteLoader::default()),
        }
    }
}

// ── Deterministic value derivation ──────────────────────────────────────────
// Every mock value is a function of (path, salt). Hash once, map the first
// eight digest bytes onto [0, 1).

fn hash_unit(path: &Path, salt: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(first) >> 11) as f64 / (1u64 << 53) as f64
}

fn hash_pick<'a>(path: &Path, salt: &str, choices: &[&'a str]) -> &'a str {
    let idx = (hash_unit(path, salt) * choices.len() as f64) as usize;
    choices[idx.min(choices.len() - 1)]
}

const KEYS: &[&str] = &["C", "G", "D", "A", "E", "F", "Bb", "Eb"];

/// Deterministic feature extraction: session-plausible values derived from
/// the input path.
#[derive(Debug, Clone, Default)]
pub struct MockFeatureEngine {
    pub fail: bool,
}

impl MockFeatureEngine {
    pub fn failing() -> Self {
        MockFeatureEngine { fail: true }
    }
}

impl FeatureExtraction for MockFeatureEngine {
    fn extract_features(&self, path: &Path) -> Result<FeatureSet, FeatureExtractionError> {
        if self.fail {
            return Err(FeatureExtractionError::Engine(
                "mock feature engine configured to fail".to_string(),
            ));
        }

        let unit = |salt: &str| hash_unit(path, salt);
        let duration = 150.0 + unit("duration") * 90.0;
        let tempo_bpm = 68.0 + unit("tempo") * 34.0;

        let sections = vec![
            section(0.0, 12.0, "intro"),
            section(12.0, duration * 0.40, "verse"),
            section(duration * 0.40, duration * 0.55, "chorus"),
            section(duration * 0.55, duration * 0.80, "verse"),
            section(duration * 0.80, duration, "outro"),
        ];

        let onset_rate = 2.0 + unit("onset_rate") * 4.0;
        let segment_count = 12;
        let rms_mean = 0.30 + unit("rms") * 0.30;
        let segment_rms: Vec<f64> = (0..segment_count)
            .map(|i| {
                // Arc shape: build, peak around two thirds, release.
                let phase = i as f64 / (segment_count - 1) as f64;
                let arc = 1.0 - (phase - 0.65).abs() * 1.2;
                (rms_mean * arc + unit(&format!("seg{i}")) * 0.05).clamp(0.02, 1.0)
            })
            .collect();

        let band_energy = FREQUENCY_BANDS
            .iter()
            .map(|(name, _)| (name.to_string(), 0.1 + unit(&format!("band_{name}")) * 0.8))
            .collect();

        let low_note = 28 + (unit("pitch_low") * 12.0) as u8;
        Ok(FeatureSet {
            duration_secs: duration,
            sample_rate: 44_100,
            tempo: TempoEstimate {
                bpm: tempo_bpm,
                confidence: 0.75 + unit("tempo_conf") * 0.20,
            },
            key: KeyEstimate {
                key: hash_pick(path, "key", KEYS).to_string(),
                mode: if unit("mode") > 0.40 { "major" } else { "minor" }.to_string(),
                confidence: 0.60 + unit("key_conf") * 0.35,
            },
            sections,
            onsets: OnsetStats {
                count: (onset_rate * duration) as usize,
                rate_hz: onset_rate,
                mean_deviation_ms: 6.0 + unit("onset_dev") * 10.0,
                std_deviation_ms: 2.0 + unit("onset_std") * 6.0,
                ahead_ratio: 0.30 + unit("ahead") * 0.40,
                offbeat_ratio: 0.45 + unit("offbeat") * 0.35,
            },
            energy: EnergyStats {
                rms_mean,
                rms_std: 0.05 + unit("rms_std") * 0.10,
                dynamic_range: 0.50 + unit("dyn") * 0.40,
                segment_rms,
            },
            spectral: SpectralSummary {
                brightness: 0.35 + unit("brightness") * 0.40,
                flatness: 0.20 + unit("flatness") * 0.30,
                attack_sharpness: 0.40 + unit("attack") * 0.40,
                band_energy,
            },
            pitch: PitchStats {
                low_note,
                high_note: low_note + 19 + (unit("pitch_span") * 17.0) as u8,
                dominant_note: low_note + 7,
            },
        })
    }
}

fn section(start: f64, end: f64, label: &str) -> Section {
    Section {
        start_secs: start,
        end_secs: end,
        label: label.to_string(),
    }
}

/// Writes placeholder stem files and returns their paths. Knobs cover the
/// failure modes the pipeline has to survive: hard failure, partial maps,
/// and slow runs (for the separation timeout).
#[derive(Debug, Clone)]
pub struct MockStemEngine {
    pub stems: Vec<String>,
    pub fail: bool,
    pub delay_ms: u64,
}

impl Default for MockStemEngine {
    fn default() -> Self {
        MockStemEngine {
            stems: ["bass", "drums", "guitar", "organ"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fail: false,
            delay_ms: 0,
        }
    }
}

impl MockStemEngine {
    pub fn failing() -> Self {
        MockStemEngine {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_stems(stems: &[&str]) -> Self {
        MockStemEngine {
            stems: stems.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay_ms(delay_ms: u64) -> Self {
        MockStemEngine {
            delay_ms,
            ..Default::default()
        }
    }
}

impl StemSeparation for MockStemEngine {
    fn separate_stems(
        &self,
        path: &Path,
        out_dir: &Path,
    ) -> Result<BTreeMap<String, PathBuf>, StemSeparationError> {
        if self.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.delay_ms));
        }
        if self.fail {
            return Err(StemSeparationError::Engine(
                "mock separation engine configured to fail".to_string(),
            ));
        }
        std::fs::create_dir_all(out_dir)?;
        let mut map = BTreeMap::new();
        for stem in &self.stems {
            let stem_path = out_dir.join(format!("{stem}.wav"));
            // Placeholder payload; real engines write actual audio here.
            std::fs::write(&stem_path, placeholder_wav(path, stem))?;
            map.insert(stem.clone(), stem_path);
        }
        Ok(map)
    }
}

fn placeholder_wav(source: &Path, stem: &str) -> Vec<u8> {
    let mut bytes = b"RIFF\x24\x00\x00\x00WAVE".to_vec();
    bytes.extend_from_slice(source.to_string_lossy().as_bytes());
    bytes.extend_from_slice(stem.as_bytes());
    bytes
}

/// Tone measurements biased toward the hinted instrument's archetype, so
/// adaptation output stays musically plausible.
#[derive(Debug, Clone, Default)]
pub struct MockToneEngine {
    pub fail: bool,
}

impl MockToneEngine {
    pub fn failing() -> Self {
        MockToneEngine { fail: true }
    }
}

impl ToneAnalysis for MockToneEngine {
    fn analyze_tone(
        &self,
        path: &Path,
        instrument_hint: Option<&str>,
    ) -> Result<MeasuredTone, ToneAnalysisError> {
        if self.fail {
            return Err(ToneAnalysisError(
                "mock tone engine configured to fail".to_string(),
            ));
        }

        let unit = |salt: &str| hash_unit(path, salt);
        let jitter = |center: f64, salt: &str| (center + (unit(salt) - 0.5) * 0.20).clamp(0.0, 1.0);

        let base = instrument_hint
            .map(tone::archetype_or_default)
            .unwrap_or(&tone::DEFAULT_ARCHETYPE);

        let band_energy = FREQUENCY_BANDS
            .iter()
            .zip(base.band_profile.iter())
            .map(|((name, _), baseline)| (name.to_string(), jitter(*baseline, name)))
            .collect();

        let segments = (0..4)
            .map(|i| ToneSnapshot {
                start_secs: i as f64 * 2.0,
                end_secs: (i + 1) as f64 * 2.0,
                brightness: jitter(base.brightness, &format!("snap_b{i}")),
                energy: jitter(base.weight, &format!("snap_e{i}")),
            })
            .collect();

        Ok(MeasuredTone {
            brightness: jitter(base.brightness, "m_brightness"),
            energy: jitter(base.weight, "m_energy"),
            flatness: jitter(1.0 - base.resonance, "m_flatness"),
            attack_sharpness: jitter(base.attack_sharpness, "m_attack"),
            band_energy,
            segments,
        })
    }
}

/// Transcribes a one-drop skeleton (bass roots + kit) at the recording's
/// tempo and reports a configurable accuracy.
#[derive(Debug, Clone)]
pub struct MockConversionEngine {
    pub accuracy: f64,
    pub fail: bool,
}

impl Default for MockConversionEngine {
    fn default() -> Self {
        MockConversionEngine {
            accuracy: 0.87,
            fail: false,
        }
    }
}

impl MockConversionEngine {
    pub fn with_accuracy(accuracy: f64) -> Self {
        MockConversionEngine {
            accuracy,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        MockConversionEngine {
            accuracy: 0.0,
            fail: true,
        }
    }
}

impl NoteConversion for MockConversionEngine {
    fn convert_to_note_events(
        &self,
        _path: &Path,
        features: &FeatureSet,
    ) -> Result<(NoteEventDocument, f64), ConversionError> {
        if self.fail {
            return Err(ConversionError::Engine(
                "mock conversion engine configured to fail".to_string(),
            ));
        }
        let tempo = features.tempo.bpm;
        let bars = ((features.duration_secs * tempo / 60.0 / 4.0) as usize).clamp(4, 64);
        let root = features.pitch.low_note.clamp(28, 43);
        Ok((one_drop_doc(tempo, bars, root), self.accuracy))
    }
}

/// Produces a native-channel session document (keys on low channels, kit on
/// channel 9) the way files from notation software arrive.
#[derive(Debug, Clone, Default)]
pub struct MockNoteLoader {
    pub fail: bool,
}

impl MockNoteLoader {
    pub fn failing() -> Self {
        MockNoteLoader { fail: true }
    }
}

impl NoteLoading for MockNoteLoader {
    fn load_note_events(&self, path: &Path) -> Result<NoteEventDocument, NoteLoadError> {
        if self.fail {
            return Err(NoteLoadError::Malformed(
                "mock loader configured to fail".to_string(),
            ));
        }
        let tempo = 72.0 + hash_unit(path, "tempo") * 24.0;
        let mut doc = one_drop_doc(tempo, 16, 33);
        // Native files carry their own channel numbering and extra parts.
        doc.tracks[0].channel = 1;
        doc.tracks[1].channel = 9;
        doc.tracks.push(NoteTrack {
            name: Some("skank".to_string()),
            channel: 2,
            program: 27,
            is_percussion: false,
            events: offbeat_chords(tempo, 16, 52),
        });
        doc.tracks.push(NoteTrack {
            name: Some("keys".to_string()),
            channel: 3,
            program: 17,
            is_percussion: false,
            events: offbeat_chords(tempo, 16, 64),
        });
        Ok(doc)
    }
}

/// Bass-and-kit skeleton: roots on the beat, kick-and-snare on three, hats
/// throughout. Velocities cycle so the quality scorer sees dynamics.
fn one_drop_doc(tempo_bpm: f64, bars: usize, root: u8) -> NoteEventDocument {
    let beat = 60.0 / tempo_bpm;
    let mut bass = Vec::new();
    let mut drums = Vec::new();
    for bar in 0..bars {
        let bar_start = bar as f64 * 4.0 * beat;
        for beat_idx in 0..4 {
            let t = bar_start + beat_idx as f64 * beat;
            // Rest on beat two every other bar; space is part of the style.
            if !(beat_idx == 1 && bar % 2 == 1) {
                bass.push(NoteEvent {
                    pitch: root + [0, 7, 0, 5][beat_idx],
                    velocity: 72 + ((bar * 5 + beat_idx * 9) % 28) as u8,
                    start_secs: t + 0.006,
                    duration_secs: beat * 0.8,
                });
            }
            drums.push(NoteEvent {
                pitch: 42,
                velocity: 58 + ((bar * 3 + beat_idx * 11) % 30) as u8,
                start_secs: t + 0.009,
                duration_secs: 0.05,
            });
            if beat_idx == 2 {
                for pitch in [36, 38] {
                    drums.push(NoteEvent {
                        pitch,
                        velocity: 96 + ((bar * 7) % 16) as u8,
                        start_secs: t + 0.004,
                        duration_secs: 0.10,
                    });
                }
            }
        }
    }
    NoteEventDocument {
        tempo_bpm,
        time_signature: (4, 4),
        tracks: vec![
            NoteTrack {
                name: Some("bass".to_string()),
                channel: 2,
                program: 33,
                is_percussion: false,
                events: bass,
            },
            NoteTrack {
                name: Some("kit".to_string()),
                channel: 10,
                program: 0,
                is_percussion: true,
                events: drums,
            },
        ],
    }
}

fn offbeat_chords(tempo_bpm: f64, bars: usize, root: u8) -> Vec<NoteEvent> {
    let beat = 60.0 / tempo_bpm;
    let mut events = Vec::new();
    for bar in 0..bars {
        let bar_start = bar as f64 * 4.0 * beat;
        for beat_idx in 0..4 {
            // The skank: chord stabs on the offbeat halves.
            let t = bar_start + beat_idx as f64 * beat + beat / 2.0;
            for interval in [0, 4, 7] {
                events.push(NoteEvent {
                    pitch: root + interval,
                    velocity: 64 + ((bar * 9 + beat_idx * 7) % 24) as u8,
                    start_secs: t + 0.011,
                    duration_secs: beat * 0.3,
                });
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_extraction_is_deterministic_per_path() {
        let engine = MockFeatureEngine::default();
        let a1 = engine.extract_features(Path::new("/music/a.wav")).unwrap();
        let a2 = engine.extract_features(Path::new("/music/a.wav")).unwrap();
        let b = engine.extract_features(Path::new("/music/b.wav")).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1.tempo.bpm, b.tempo.bpm);
        assert!((68.0..=102.0).contains(&a1.tempo.bpm));
        assert_eq!(a1.spectral.band_energy.len(), FREQUENCY_BANDS.len());
        assert!(a1.pitch.high_note > a1.pitch.low_note);
    }

    #[test]
    fn failing_feature_engine_reports_engine_error() {
        let err = MockFeatureEngine::failing()
            .extract_features(Path::new("/music/a.wav"))
            .unwrap_err();
        assert!(matches!(err, FeatureExtractionError::Engine(_)));
    }

    #[test]
    fn stem_engine_writes_requested_stems() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockStemEngine::with_stems(&["bass", "drums"]);
        let map = engine
            .separate_stems(Path::new("/music/a.wav"), dir.path())
            .unwrap();
        assert_eq!(map.len(), 2);
        for path in map.values() {
            assert!(path.exists());
        }
        assert!(map["bass"].file_name().is_some_and(|n| n == "bass.wav"));
    }

    #[test]
    fn failing_stem_engine_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stems");
        let err = MockStemEngine::failing()
            .separate_stems(Path::new("/music/a.wav"), &out)
            .unwrap_err();
        assert!(matches!(err, StemSeparationError::Engine(_)));
        assert!(!out.exists());
    }

    #[test]
    fn tone_engine_tracks_hinted_archetype() {
        let engine = MockToneEngine::default();
        let measured = engine
            .analyze_tone(Path::new("/music/a.wav"), Some("bass"))
            .unwrap();
        let base = tone::archetype("bass").unwrap();
        // Jitter is bounded to ±0.1 around the archetype.
        assert!((measured.brightness - base.brightness).abs() <= 0.1 + 1e-9);
        assert!((measured.energy - base.weight).abs() <= 0.1 + 1e-9);
        assert_eq!(measured.segments.len(), 4);
    }

    #[test]
    fn conversion_matches_feature_tempo_and_reports_accuracy() {
        let features = MockFeatureEngine::default()
            .extract_features(Path::new("/music/a.wav"))
            .unwrap();
        let (doc, accuracy) = MockConversionEngine::with_accuracy(0.42)
            .convert_to_note_events(Path::new("/music/a.wav"), &features)
            .unwrap();
        assert_eq!(accuracy, 0.42);
        assert_eq!(doc.tempo_bpm, features.tempo.bpm);
        assert_eq!(doc.tracks.len(), 2);
        assert!(doc.total_events() > 0);
    }

    #[test]
    fn loader_produces_native_channels() {
        let doc = MockNoteLoader::default()
            .load_note_events(Path::new("/music/session.mid"))
            .unwrap();
        assert_eq!(doc.tracks.len(), 4);
        assert!(doc.tracks.iter().any(|t| t.is_percussion && t.channel == 9));
        assert!(doc.tracks.iter().any(|t| t.program == 27));
    }
}
