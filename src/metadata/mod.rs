//! The metadata record: the auditable system of record for one source file.
//!
//! A [`MetadataRecord`] collects file references, the ordered processing
//! history, per-channel analyses and derived summaries. All mutation goes
//! through validated operations; the stage history is append-only, channel
//! analyses must resolve in the channel registry, and finalization happens
//! exactly once. The record round-trips through JSON unchanged.

pub mod types;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::channels::{ChannelId, ChannelRegistry};

pub use types::{
    ChannelAnalysis, ChannelSummary, EnrichmentRecord, FileKind, FileReference, GrooveContext,
    GrooveSummary, ProcessingSummary, RelationshipSummary, StageRecord, StageStatus,
    TimingStats, TrainingExport, TrainingFeatures,
};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("channel {0} is not in the registry")]
    UnknownChannel(ChannelId),

    #[error("channel {0} already has an analysis attached")]
    DuplicateChannel(ChannelId),

    #[error("file reference role '{0}' already present")]
    DuplicateFileReference(String),

    #[error("stage '{0}' starts before the previous history entry")]
    OutOfOrderStage(String),

    #[error("{0} already attached")]
    AlreadyAttached(&'static str),

    #[error("record already finalized")]
    AlreadyFinalized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("metadata document malformed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Auditable metadata for exactly one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    id: String,
    created_at: DateTime<Utc>,
    source_path: PathBuf,
    file_references: BTreeMap<String, FileReference>,
    processing_stage_history: Vec<StageRecord>,
    channel_analyses: BTreeMap<ChannelId, ChannelAnalysis>,
    relationship_summary: Option<RelationshipSummary>,
    groove_summary: Option<GrooveSummary>,
    training_features: Option<TrainingFeatures>,
    enrichment_records: Vec<EnrichmentRecord>,
    processing_complete: bool,
    overall_accuracy_score: Option<f64>,
    validation_passed: bool,
}

impl MetadataRecord {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        MetadataRecord {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            source_path: source_path.into(),
            file_references: BTreeMap::new(),
            processing_stage_history: Vec::new(),
            channel_analyses: BTreeMap::new(),
            relationship_summary: None,
            groove_summary: None,
            training_features: None,
            enrichment_records: Vec::new(),
            processing_complete: false,
            overall_accuracy_score: None,
            validation_passed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn file_references(&self) -> &BTreeMap<String, FileReference> {
        &self.file_references
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.processing_stage_history
    }

    pub fn channel_analyses(&self) -> &BTreeMap<ChannelId, ChannelAnalysis> {
        &self.channel_analyses
    }

    pub fn relationship_summary(&self) -> Option<&RelationshipSummary> {
        self.relationship_summary.as_ref()
    }

    pub fn groove_summary(&self) -> Option<&GrooveSummary> {
        self.groove_summary.as_ref()
    }

    pub fn training_features(&self) -> Option<&TrainingFeatures> {
        self.training_features.as_ref()
    }

    pub fn enrichment_records(&self) -> &[EnrichmentRecord] {
        &self.enrichment_records
    }

    pub fn is_complete(&self) -> bool {
        self.processing_complete
    }

    pub fn overall_accuracy_score(&self) -> Option<f64> {
        self.overall_accuracy_score
    }

    pub fn validation_passed(&self) -> bool {
        self.validation_passed
    }

    /// Track a file under a role key ("original", "stem_bass", ...). Each
    /// role is attached once; references are immutable afterwards.
    pub fn add_file_reference(&mut self, role: &str, reference: FileReference) -> Result<()> {
        if self.file_references.contains_key(role) {
            return Err(MetadataError::DuplicateFileReference(role.to_string()));
        }
        self.file_references.insert(role.to_string(), reference);
        Ok(())
    }

    /// Append one stage record. History only ever grows, and stays ordered
    /// by start time.
    pub fn add_processing_stage(&mut self, record: StageRecord) -> Result<()> {
        if let Some(last) = self.processing_stage_history.last() {
            if record.start_time < last.start_time {
                return Err(MetadataError::OutOfOrderStage(record.stage_name));
            }
        }
        self.processing_stage_history.push(record);
        Ok(())
    }

    /// Attach a per-channel analysis. The channel must exist in the registry
    /// and must not have been analyzed already.
    pub fn add_channel_analysis(
        &mut self,
        registry: &ChannelRegistry,
        analysis: ChannelAnalysis,
    ) -> Result<()> {
        let channel = analysis.channel_id;
        if !registry.contains(channel) {
            return Err(MetadataError::UnknownChannel(channel));
        }
        if self.channel_analyses.contains_key(&channel) {
            return Err(MetadataError::DuplicateChannel(channel));
        }
        self.channel_analyses.insert(channel, analysis);
        Ok(())
    }

    /// Fill in event counts once a note-event document exists. Only zero
    /// counts are raised; channels without an analysis are ignored.
    pub fn fill_event_counts(&mut self, counts: &BTreeMap<ChannelId, usize>) {
        for (channel, count) in counts {
            if let Some(analysis) = self.channel_analyses.get_mut(channel) {
                if analysis.event_count == 0 {
                    analysis.event_count = *count;
                }
            }
        }
    }

    pub fn set_relationship_summary(&mut self, summary: RelationshipSummary) -> Result<()> {
        if self.relationship_summary.is_some() {
            return Err(MetadataError::AlreadyAttached("relationship summary"));
        }
        self.relationship_summary = Some(summary);
        Ok(())
    }

    pub fn set_groove_summary(&mut self, summary: GrooveSummary) -> Result<()> {
        if self.groove_summary.is_some() {
            return Err(MetadataError::AlreadyAttached("groove summary"));
        }
        self.groove_summary = Some(summary);
        Ok(())
    }

    pub fn set_training_features(&mut self, features: TrainingFeatures) -> Result<()> {
        if self.training_features.is_some() {
            return Err(MetadataError::AlreadyAttached("training features"));
        }
        self.training_features = Some(features);
        Ok(())
    }

    pub fn add_enrichment_record(&mut self, record: EnrichmentRecord) {
        self.enrichment_records.push(record);
    }

    /// Close the record. Fixes the overall accuracy and the validation
    /// verdict; callable exactly once. A missing accuracy is a non-pass.
    pub fn finalize(&mut self, accuracy: Option<f64>) -> Result<()> {
        if self.processing_complete {
            return Err(MetadataError::AlreadyFinalized);
        }
        self.processing_complete = true;
        self.overall_accuracy_score = accuracy;
        self.validation_passed = matches!(accuracy, Some(a) if a >= crate::ACCURACY_THRESHOLD);
        Ok(())
    }

    /// Counts by stage status plus the record-level verdict.
    pub fn processing_summary(&self) -> ProcessingSummary {
        let mut completed = 0;
        let mut failed = 0;
        let mut validated = 0;
        for stage in &self.processing_stage_history {
            match stage.status {
                StageStatus::Completed => completed += 1,
                StageStatus::Failed => failed += 1,
                StageStatus::Validated => validated += 1,
                StageStatus::Pending | StageStatus::Running => {}
            }
        }
        ProcessingSummary {
            total_stages: self.processing_stage_history.len(),
            completed,
            failed,
            validated,
            overall_accuracy_score: self.overall_accuracy_score,
            validation_passed: self.validation_passed,
            processing_complete: self.processing_complete,
        }
    }

    pub fn channel_summary(&self) -> ChannelSummary {
        let instruments = self
            .channel_analyses
            .iter()
            .map(|(channel, analysis)| (*channel, analysis.instrument_name.clone()))
            .collect();
        let total_events = self
            .channel_analyses
            .values()
            .map(|analysis| analysis.event_count)
            .sum();
        ChannelSummary {
            instruments,
            total_events,
        }
    }

    /// Flatten one channel's analysis (plus groove context, when present)
    /// for a downstream training consumer. None if the channel was never
    /// analyzed in this record.
    pub fn export_for_training(&self, channel: ChannelId) -> Option<TrainingExport> {
        let analysis = self.channel_analyses.get(&channel)?;
        let groove_context = self.groove_summary.as_ref().map(|groove| GrooveContext {
            style_tag: groove.style_tag.clone(),
            tempo_bpm: groove.tempo_bpm,
            tempo_stability: groove.tempo_stability,
            key: groove.key.clone(),
            mode: groove.mode.clone(),
        });
        Some(TrainingExport {
            record_id: self.id.clone(),
            channel_id: analysis.channel_id,
            instrument_name: analysis.instrument_name.clone(),
            note_range: analysis.note_range,
            velocity_curve: analysis.velocity_curve.clone(),
            timing_variation: analysis.timing_variation.clone(),
            playing_pattern_tags: analysis.playing_pattern_tags.clone(),
            harmonic_function: analysis.harmonic_function.clone(),
            interaction_strengths: analysis.interaction_strengths.clone(),
            behavioral_traits: analysis.behavioral_traits.clone(),
            tone_profile: analysis.tone_profile.clone(),
            event_count: analysis.event_count,
            dominant_rhythmic_pattern: analysis.dominant_rhythmic_pattern.clone(),
            groove_context,
        })
    }

    /// Write the record as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load a record previously written by [`MetadataRecord::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tone;
    use chrono::Duration;

    fn analysis_for(channel: ChannelId, instrument: &str) -> ChannelAnalysis {
        ChannelAnalysis {
            channel_id: channel,
            instrument_name: instrument.to_string(),
            note_range: (28, 55),
            velocity_curve: vec![70, 80, 75],
            timing_variation: TimingStats {
                mean_deviation_ms: 8.0,
                std_deviation_ms: 3.0,
                ahead_ratio: 0.4,
            },
            playing_pattern_tags: vec!["root_emphasis".to_string()],
            harmonic_function: "root_provider".to_string(),
            interaction_strengths: BTreeMap::from([(ChannelId::DRUMS, 0.95)]),
            behavioral_traits: BTreeMap::from([("root_emphasis".to_string(), 0.9)]),
            tone_profile: tone::unmeasured(tone::archetype_or_default(instrument)),
            event_count: 0,
            dominant_rhythmic_pattern: "one_drop".to_string(),
        }
    }

    fn stage(name: &str, status: StageStatus, start: DateTime<Utc>) -> StageRecord {
        StageRecord {
            stage_name: name.to_string(),
            status,
            start_time: start,
            end_time: Some(start + Duration::milliseconds(5)),
            duration_secs: Some(0.005),
            accuracy_score: None,
            confidence_score: None,
            error_message: None,
        }
    }

    #[test]
    fn new_record_is_open_and_unvalidated() {
        let record = MetadataRecord::new("/music/take1.wav");
        assert!(!record.is_complete());
        assert!(!record.validation_passed());
        assert!(record.overall_accuracy_score().is_none());
        assert!(record.history().is_empty());
        assert!(!record.id().is_empty());
    }

    #[test]
    fn file_reference_roles_are_attach_once() {
        let mut record = MetadataRecord::new("/music/take1.wav");
        let reference = FileReference {
            id: format!("{}:original", record.id()),
            kind: FileKind::SourceAudio,
            path: PathBuf::from("/music/take1.wav"),
            size: 1024,
            checksum: Some("ab".repeat(32)),
            created_at: Utc::now(),
        };
        record.add_file_reference("original", reference.clone()).unwrap();
        let err = record.add_file_reference("original", reference).unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateFileReference(_)));
    }

    #[test]
    fn history_is_append_only_and_ordered() {
        let mut record = MetadataRecord::new("/music/take1.wav");
        let t0 = Utc::now();
        record
            .add_processing_stage(stage("feature_extraction", StageStatus::Completed, t0))
            .unwrap();
        record
            .add_processing_stage(stage(
                "stem_separation",
                StageStatus::Failed,
                t0 + Duration::seconds(1),
            ))
            .unwrap();
        assert_eq!(record.history().len(), 2);

        let err = record
            .add_processing_stage(stage(
                "time_travel",
                StageStatus::Completed,
                t0 - Duration::seconds(10),
            ))
            .unwrap_err();
        assert!(matches!(err, MetadataError::OutOfOrderStage(_)));
        assert_eq!(record.history().len(), 2);
    }

    #[test]
    fn channel_analysis_requires_registered_channel() {
        let registry = ChannelRegistry::new();
        let mut record = MetadataRecord::new("/music/take1.wav");

        let err = record
            .add_channel_analysis(&registry, analysis_for(ChannelId(42), "theremin"))
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnknownChannel(_)));

        record
            .add_channel_analysis(&registry, analysis_for(ChannelId::BASS, "bass"))
            .unwrap();
        let err = record
            .add_channel_analysis(&registry, analysis_for(ChannelId::BASS, "bass"))
            .unwrap_err();
        assert!(matches!(err, MetadataError::DuplicateChannel(_)));
    }

    #[test]
    fn summaries_attach_once() {
        let mut record = MetadataRecord::new("/music/take1.wav");
        let groove = GrooveSummary {
            style_tag: "one_drop".to_string(),
            tempo_bpm: 75.0,
            tempo_stability: 0.95,
            key: "C".to_string(),
            mode: "major".to_string(),
            time_signature: "4/4".to_string(),
            micro_timing: vec![0.0, -0.01, 0.02, -0.005],
            dynamic_arc: vec![0.4, 0.6, 0.5],
            section_labels: vec!["intro".to_string(), "verse".to_string()],
            harmonic_rhythm: 2.0,
        };
        record.set_groove_summary(groove.clone()).unwrap();
        let err = record.set_groove_summary(groove).unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyAttached(_)));
    }

    #[test]
    fn finalize_fixes_verdict_exactly_once() {
        let mut record = MetadataRecord::new("/music/take1.wav");
        record.finalize(Some(0.87)).unwrap();
        assert!(record.is_complete());
        assert_eq!(record.overall_accuracy_score(), Some(0.87));
        assert!(record.validation_passed());

        let err = record.finalize(Some(0.99)).unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyFinalized));
        assert_eq!(record.overall_accuracy_score(), Some(0.87));
    }

    #[test]
    fn validation_threshold_is_exact() {
        let mut at = MetadataRecord::new("/a.wav");
        at.finalize(Some(0.85)).unwrap();
        assert!(at.validation_passed());

        let mut below = MetadataRecord::new("/b.wav");
        below.finalize(Some(0.8499)).unwrap();
        assert!(!below.validation_passed());
    }

    #[test]
    fn missing_accuracy_never_validates() {
        let mut record = MetadataRecord::new("/music/take1.wav");
        record.finalize(None).unwrap();
        assert!(record.is_complete());
        assert!(!record.validation_passed());
        assert!(record.overall_accuracy_score().is_none());
    }

    #[test]
    fn processing_summary_counts_by_status() {
        let mut record = MetadataRecord::new("/music/take1.wav");
        let t0 = Utc::now();
        record
            .add_processing_stage(stage("feature_extraction", StageStatus::Completed, t0))
            .unwrap();
        record
            .add_processing_stage(stage(
                "stem_separation",
                StageStatus::Failed,
                t0 + Duration::seconds(1),
            ))
            .unwrap();
        record
            .add_processing_stage(stage(
                "note_event_conversion",
                StageStatus::Validated,
                t0 + Duration::seconds(2),
            ))
            .unwrap();
        record.finalize(Some(0.9)).unwrap();

        let summary = record.processing_summary();
        assert_eq!(summary.total_stages, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.validated, 1);
        assert!(summary.validation_passed);
        assert!(summary.processing_complete);
    }

    #[test]
    fn channel_summary_lists_instruments_and_events() {
        let registry = ChannelRegistry::new();
        let mut record = MetadataRecord::new("/music/take1.wav");
        record
            .add_channel_analysis(&registry, analysis_for(ChannelId::BASS, "bass"))
            .unwrap();
        let mut drums = analysis_for(ChannelId::DRUMS, "drums");
        drums.event_count = 128;
        record.add_channel_analysis(&registry, drums).unwrap();

        let summary = record.channel_summary();
        assert_eq!(summary.instruments.len(), 2);
        assert_eq!(summary.instruments[&ChannelId::BASS], "bass");
        assert_eq!(summary.total_events, 128);
    }

    #[test]
    fn fill_event_counts_only_raises_zeroes() {
        let registry = ChannelRegistry::new();
        let mut record = MetadataRecord::new("/music/take1.wav");
        record
            .add_channel_analysis(&registry, analysis_for(ChannelId::BASS, "bass"))
            .unwrap();
        let mut drums = analysis_for(ChannelId::DRUMS, "drums");
        drums.event_count = 10;
        record.add_channel_analysis(&registry, drums).unwrap();

        record.fill_event_counts(&BTreeMap::from([
            (ChannelId::BASS, 64),
            (ChannelId::DRUMS, 256),
            (ChannelId::ORGAN, 32),
        ]));

        assert_eq!(record.channel_analyses()[&ChannelId::BASS].event_count, 64);
        // Already counted; not overwritten
        assert_eq!(record.channel_analyses()[&ChannelId::DRUMS].event_count, 10);
        assert!(!record.channel_analyses().contains_key(&ChannelId::ORGAN));
    }

    #[test]
    fn export_for_training_requires_an_analysis() {
        let registry = ChannelRegistry::new();
        let mut record = MetadataRecord::new("/music/take1.wav");
        assert!(record.export_for_training(ChannelId::BASS).is_none());

        record
            .add_channel_analysis(&registry, analysis_for(ChannelId::BASS, "bass"))
            .unwrap();
        record
            .set_groove_summary(GrooveSummary {
                style_tag: "steppers".to_string(),
                tempo_bpm: 140.0,
                tempo_stability: 0.9,
                key: "A".to_string(),
                mode: "minor".to_string(),
                time_signature: "4/4".to_string(),
                micro_timing: vec![],
                dynamic_arc: vec![],
                section_labels: vec![],
                harmonic_rhythm: 1.0,
            })
            .unwrap();

        let export = record.export_for_training(ChannelId::BASS).unwrap();
        assert_eq!(export.instrument_name, "bass");
        assert_eq!(export.record_id, record.id());
        let groove = export.groove_context.unwrap();
        assert_eq!(groove.style_tag, "steppers");
        assert_eq!(groove.tempo_bpm, 140.0);
    }

    #[test]
    fn record_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChannelRegistry::new();
        let mut record = MetadataRecord::new("/music/take1.wav");
        record
            .add_file_reference(
                "original",
                FileReference {
                    id: format!("{}:original", record.id()),
                    kind: FileKind::SourceAudio,
                    path: PathBuf::from("/music/take1.wav"),
                    size: 44100,
                    checksum: Some("00".repeat(32)),
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        record
            .add_file_reference(
                "stem_bass",
                FileReference {
                    id: format!("{}:stem_bass", record.id()),
                    kind: FileKind::DerivedStem,
                    path: PathBuf::from("/music/processed/stems/take1/bass.wav"),
                    size: 2048,
                    checksum: None,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        record
            .add_channel_analysis(&registry, analysis_for(ChannelId::BASS, "bass"))
            .unwrap();
        record
            .add_processing_stage(stage(
                "feature_extraction",
                StageStatus::Completed,
                Utc::now(),
            ))
            .unwrap();
        record.finalize(Some(0.91)).unwrap();

        let path = dir.path().join("take1.metadata.json");
        record.save(&path).unwrap();
        let loaded = MetadataRecord::load(&path).unwrap();

        assert_eq!(loaded.id(), record.id());
        assert_eq!(loaded.created_at(), record.created_at());
        assert_eq!(loaded.file_references(), record.file_references());
        assert_eq!(loaded, record);
    }
}
