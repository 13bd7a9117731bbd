//! Plain data types owned by the metadata record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::ChannelId;
use crate::tone::ToneProfile;

/// What a tracked file is, relative to its source recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    SourceAudio,
    SourceNoteEvents,
    DerivedStem,
    DerivedNoteEvents,
    Metadata,
}

/// One tracked file. Immutable once created; other structures refer to it
/// by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: String,
    pub kind: FileKind,
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 hex digest; None for files that no longer exist (or were
    /// never hashed, e.g. short-lived derived artifacts).
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Validated,
}

/// One entry in the processing history. Appended once, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_name: String,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub accuracy_score: Option<f64>,
    pub confidence_score: Option<f64>,
    pub error_message: Option<String>,
}

/// Micro-timing statistics for one channel (milliseconds against the grid).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub mean_deviation_ms: f64,
    pub std_deviation_ms: f64,
    /// Fraction of events landing ahead of the beat.
    pub ahead_ratio: f64,
}

/// Full per-channel analysis attached to the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAnalysis {
    pub channel_id: ChannelId,
    pub instrument_name: String,
    /// Observed note range (note numbers, inclusive).
    pub note_range: (u8, u8),
    /// Velocity envelope over the performance, one step per segment.
    pub velocity_curve: Vec<u8>,
    pub timing_variation: TimingStats,
    pub playing_pattern_tags: Vec<String>,
    pub harmonic_function: String,
    /// Coupling strength to other channels, keyed by partner channel.
    pub interaction_strengths: BTreeMap<ChannelId, f64>,
    pub behavioral_traits: BTreeMap<String, f64>,
    pub tone_profile: ToneProfile,
    /// Note events attributed to this channel; 0 until a note-event document
    /// is available for counting.
    pub event_count: usize,
    pub dominant_rhythmic_pattern: String,
}

/// Pairwise ensemble relationships derived from the channel analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSummary {
    /// How tightly bass and drums share the pocket, 0..1.
    pub bass_drum_lock: f64,
    pub harmonic_coherence: f64,
    /// Dominant subdivision label ("eighth_note", "sixteenth_note").
    pub rhythmic_subdivision: String,
    pub groove_pocket: f64,
    /// Velocity-envelope correlation per channel pair ("bass_drums" keys).
    pub dynamic_correlation: BTreeMap<String, f64>,
    pub call_response_pairs: Vec<(ChannelId, ChannelId)>,
}

/// Whole-performance groove descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrooveSummary {
    /// Riddim family: "one_drop", "steppers" or "rockers".
    pub style_tag: String,
    pub tempo_bpm: f64,
    pub tempo_stability: f64,
    pub key: String,
    pub mode: String,
    pub time_signature: String,
    /// Per-beat offsets from the grid, seconds, one bar.
    pub micro_timing: Vec<f64>,
    /// Coarse energy envelope across the performance.
    pub dynamic_arc: Vec<f64>,
    pub section_labels: Vec<String>,
    /// Chord changes per bar.
    pub harmonic_rhythm: f64,
}

/// Flat numeric vectors assembled for downstream model training.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingFeatures {
    pub tone_vectors: BTreeMap<ChannelId, Vec<f64>>,
    pub behavior_vectors: BTreeMap<ChannelId, Vec<f64>>,
    pub rhythm_vectors: BTreeMap<ChannelId, Vec<f64>>,
    /// (from, to, strength) triples over the analyzed channels.
    pub interaction_matrix: Vec<(ChannelId, ChannelId, f64)>,
    pub groove_context: Vec<f64>,
}

/// External metadata attached from an enrichment source (tag database,
/// fingerprint service). Purely additive; never consulted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub source: String,
    pub track_title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub release_year: Option<i32>,
    pub genre: Option<String>,
    pub tempo_detected: Option<f64>,
    pub key_detected: Option<String>,
    pub energy: Option<f64>,
    pub confidence: Option<f64>,
    pub retrieved_at: DateTime<Utc>,
}

/// Stage-status counts plus the record-level verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub total_stages: usize,
    pub completed: usize,
    pub failed: usize,
    pub validated: usize,
    pub overall_accuracy_score: Option<f64>,
    pub validation_passed: bool,
    pub processing_complete: bool,
}

/// Which instruments were analyzed, and how much material each carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub instruments: BTreeMap<ChannelId, String>,
    pub total_events: usize,
}

/// Groove fields worth carrying into a per-channel training export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrooveContext {
    pub style_tag: String,
    pub tempo_bpm: f64,
    pub tempo_stability: f64,
    pub key: String,
    pub mode: String,
}

/// One channel's analysis flattened for a downstream training consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExport {
    pub record_id: String,
    pub channel_id: ChannelId,
    pub instrument_name: String,
    pub note_range: (u8, u8),
    pub velocity_curve: Vec<u8>,
    pub timing_variation: TimingStats,
    pub playing_pattern_tags: Vec<String>,
    pub harmonic_function: String,
    pub interaction_strengths: BTreeMap<ChannelId, f64>,
    pub behavioral_traits: BTreeMap<String, f64>,
    pub tone_profile: ToneProfile,
    pub event_count: usize,
    pub dominant_rhythmic_pattern: String,
    pub groove_context: Option<GrooveContext>,
}
