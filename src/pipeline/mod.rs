//! The staged processing pipeline.
//!
//! One [`Pipeline::process`] call takes a single input file through an
//! ordered stage list (one list per input kind), records every attempted
//! stage in the metadata record, applies the stem retention policy, and
//! persists the finished record. Stages are entries in a table; the
//! orchestrator is a small interpreter over that table, so failure policy
//! (critical vs. absorbed) lives in exactly one place.

pub mod audio;
pub mod retention;
pub mod symbolic;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::channels::ChannelRegistry;
use crate::config::AppConfig;
use crate::engines::{
    ConversionError, Engines, FeatureExtractionError, FeatureSet, NoteLoadError,
    StemSeparationError, ToneAnalysisError,
};
use crate::metadata::types::{FileKind, StageRecord, StageStatus};
use crate::metadata::{MetadataError, MetadataRecord};
use crate::notes::{NoteEventDocument, QualityReport};
use crate::storage::{self, StorageError};
use crate::tone::MeasuredTone;

/// What kind of input a path is, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Audio,
    NoteEvents,
}

impl InputKind {
    pub fn label(&self) -> &'static str {
        match self {
            InputKind::Audio => "audio",
            InputKind::NoteEvents => "note-event",
        }
    }
}

pub fn detect_input_kind(path: &Path) -> Option<InputKind> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if crate::SUPPORTED_AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(InputKind::Audio)
    } else if crate::SUPPORTED_NOTE_EXTENSIONS.contains(&ext.as_str()) {
        Some(InputKind::NoteEvents)
    } else {
        None
    }
}

/// Failure inside one stage. Whether it aborts the run is the stage table's
/// call (`critical`), not the error's.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    FeatureExtraction(#[from] FeatureExtractionError),

    #[error(transparent)]
    StemSeparation(#[from] StemSeparationError),

    #[error(transparent)]
    Tone(#[from] ToneAnalysisError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    NoteLoad(#[from] NoteLoadError),

    #[error("stem separation timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Other(String),
}

/// Run-aborting failure.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unsupported file extension '{0}'")]
    UnsupportedInputKind(String),

    #[error("stage '{stage}' failed: {source}")]
    Fatal {
        stage: &'static str,
        #[source]
        source: StageError,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// What a stage hands back for its history entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOutput {
    pub accuracy: Option<f64>,
    pub confidence: Option<f64>,
}

impl StageOutput {
    pub fn with_confidence(confidence: f64) -> Self {
        StageOutput {
            accuracy: None,
            confidence: Some(confidence),
        }
    }

    pub fn scored(accuracy: f64, confidence: f64) -> Self {
        StageOutput {
            accuracy: Some(accuracy),
            confidence: Some(confidence),
        }
    }
}

/// Everything a run accumulates while its stages execute.
pub struct RunState {
    pub track: String,
    pub source_path: PathBuf,
    pub output_root: PathBuf,
    pub record: MetadataRecord,
    pub features: Option<FeatureSet>,
    /// Whole-mix tone measurement; fallback for stems whose own tone
    /// analysis fails.
    pub mix_tone: Option<MeasuredTone>,
    pub stems: BTreeMap<String, PathBuf>,
    /// Converted (audio branch) or loaded (note-event branch) document.
    pub document: Option<NoteEventDocument>,
    /// Derived note-event artifact on disk.
    pub document_path: Option<PathBuf>,
    pub quality: Option<QualityReport>,
    pub accuracy: Option<f64>,
    pub stems_deleted: bool,
}

impl RunState {
    fn new(input: &Path, output_root: PathBuf) -> Self {
        RunState {
            track: storage::track_name(input),
            source_path: input.to_path_buf(),
            output_root,
            record: MetadataRecord::new(input),
            features: None,
            mix_tone: None,
            stems: BTreeMap::new(),
            document: None,
            document_path: None,
            quality: None,
            accuracy: None,
            stems_deleted: false,
        }
    }
}

/// One entry in a branch's stage table.
pub struct Stage {
    pub name: &'static str,
    /// Critical stages abort the run on failure; the rest degrade.
    pub critical: bool,
    /// Stages that do not apply are not attempted and leave no history entry.
    pub applies: fn(&RunState) -> bool,
    pub run: fn(&Pipeline, &mut RunState) -> Result<StageOutput, StageError>,
}

fn always(_state: &RunState) -> bool {
    true
}

fn has_stems(state: &RunState) -> bool {
    !state.stems.is_empty()
}

const AUDIO_STAGES: &[Stage] = &[
    Stage {
        name: "feature_extraction",
        critical: true,
        applies: always,
        run: audio::extract_features,
    },
    Stage {
        name: "tone_analysis",
        critical: false,
        applies: always,
        run: audio::analyze_tone,
    },
    Stage {
        name: "stem_separation",
        critical: false,
        applies: always,
        run: audio::separate_stems,
    },
    Stage {
        name: "stem_analysis",
        critical: false,
        applies: has_stems,
        run: audio::analyze_stems,
    },
    Stage {
        name: "note_conversion",
        critical: false,
        applies: always,
        run: audio::convert_notes,
    },
    Stage {
        name: "interaction_analysis",
        critical: false,
        applies: always,
        run: audio::analyze_interactions,
    },
    Stage {
        name: "cleanup",
        critical: false,
        applies: has_stems,
        run: audio::cleanup_stems,
    },
];

const NOTE_STAGES: &[Stage] = &[
    Stage {
        name: "note_loading",
        critical: true,
        applies: always,
        run: symbolic::load_document,
    },
    Stage {
        name: "quality_scoring",
        critical: false,
        applies: always,
        run: symbolic::score_quality,
    },
    Stage {
        name: "channel_analysis",
        critical: false,
        applies: always,
        run: symbolic::analyze_channels,
    },
    Stage {
        name: "standardization",
        critical: false,
        applies: always,
        run: symbolic::standardize_document,
    },
];

/// Tempo agreement between two sources, 1.0 when they name the same tempo.
pub fn tempo_agreement(audio_bpm: f64, note_bpm: f64) -> f64 {
    let max = audio_bpm.max(note_bpm);
    if max <= f64::EPSILON {
        return 0.0;
    }
    (1.0 - (audio_bpm - note_bpm).abs() / max).clamp(0.0, 1.0)
}

/// Cross-modal reconciliation: the revised accuracy is the running average
/// of the collaborator's score and the tempo agreement. An average, not a
/// max or min; both signals carry information.
pub fn refine_accuracy(accuracy: f64, audio_bpm: f64, note_bpm: f64) -> f64 {
    ((accuracy + tempo_agreement(audio_bpm, note_bpm)) / 2.0).clamp(0.0, 1.0)
}

/// The outcome of one `process` call. Failed runs still carry whatever was
/// gathered before the abort.
#[derive(Debug)]
pub struct ProcessingResult {
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Option<MetadataRecord>,
    pub stems_map: BTreeMap<String, PathBuf>,
    pub derived_note_events_path: Option<PathBuf>,
    pub conversion_accuracy: Option<f64>,
    pub validation_passed: bool,
    pub stems_deleted: bool,
}

pub struct Pipeline {
    config: AppConfig,
    registry: Arc<ChannelRegistry>,
    engines: Engines,
}

impl Pipeline {
    pub fn new(config: AppConfig, registry: Arc<ChannelRegistry>, engines: Engines) -> Self {
        Pipeline {
            config,
            registry,
            engines,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    /// Derived artifacts land next to the input unless the config says
    /// otherwise.
    fn output_root_for(&self, input: &Path) -> PathBuf {
        match &self.config.output_root {
            Some(root) => root.clone(),
            None => input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Process one file end to end. Never panics and never returns `Err`;
    /// every outcome, including rejection, is a `ProcessingResult`.
    pub fn process(&self, input: &Path) -> ProcessingResult {
        let Some(kind) = detect_input_kind(input) else {
            let extension = input
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            let err = ProcessError::UnsupportedInputKind(extension);
            warn!("{}: {err}", input.display());
            return ProcessingResult {
                success: false,
                error: Some(err.to_string()),
                metadata: None,
                stems_map: BTreeMap::new(),
                derived_note_events_path: None,
                conversion_accuracy: None,
                validation_passed: false,
                stems_deleted: false,
            };
        };

        info!("processing {} ({} input)", input.display(), kind.label());
        let mut state = RunState::new(input, self.output_root_for(input));
        match self.run(kind, &mut state) {
            Ok(()) => ProcessingResult {
                success: true,
                error: None,
                conversion_accuracy: state.accuracy,
                validation_passed: state.record.validation_passed(),
                stems_deleted: state.stems_deleted,
                stems_map: state.stems,
                derived_note_events_path: state.document_path,
                metadata: Some(state.record),
            },
            Err(err) => {
                error!("processing {} failed: {err}", input.display());
                ProcessingResult {
                    success: false,
                    error: Some(err.to_string()),
                    conversion_accuracy: state.accuracy,
                    validation_passed: false,
                    stems_deleted: state.stems_deleted,
                    stems_map: state.stems,
                    derived_note_events_path: state.document_path,
                    metadata: Some(state.record),
                }
            }
        }
    }

    fn run(&self, kind: InputKind, state: &mut RunState) -> Result<(), ProcessError> {
        let record_id = state.record.id().to_string();
        let source_kind = match kind {
            InputKind::Audio => FileKind::SourceAudio,
            InputKind::NoteEvents => FileKind::SourceNoteEvents,
        };
        state.record.add_file_reference(
            "original",
            storage::file_reference(&record_id, "original", source_kind, &state.source_path),
        )?;

        let stages = match kind {
            InputKind::Audio => AUDIO_STAGES,
            InputKind::NoteEvents => NOTE_STAGES,
        };
        self.run_stages(stages, state)?;

        if kind == InputKind::NoteEvents {
            // Already symbolic; there is no conversion to validate.
            state.accuracy = Some(1.0);
        }

        let metadata_file = storage::metadata_path(&state.output_root, &state.track);
        state.record.add_file_reference(
            "metadata",
            storage::file_reference(&record_id, "metadata", FileKind::Metadata, &metadata_file),
        )?;
        state.record.finalize(state.accuracy)?;
        state.record.save(&metadata_file)?;
        info!(
            "{}: accuracy {:?}, validation {}",
            state.track,
            state.accuracy,
            if state.record.validation_passed() {
                "passed"
            } else {
                "not passed"
            }
        );
        Ok(())
    }

    fn run_stages(&self, stages: &[Stage], state: &mut RunState) -> Result<(), ProcessError> {
        for stage in stages {
            if !(stage.applies)(state) {
                debug!("stage '{}' does not apply, skipping", stage.name);
                continue;
            }
            debug!("stage '{}' starting", stage.name);
            let start = Utc::now();
            match (stage.run)(self, state) {
                Ok(output) => {
                    let end = Utc::now();
                    state.record.add_processing_stage(StageRecord {
                        stage_name: stage.name.to_string(),
                        status: StageStatus::Completed,
                        start_time: start,
                        end_time: Some(end),
                        duration_secs: Some((end - start).num_milliseconds() as f64 / 1000.0),
                        accuracy_score: output.accuracy,
                        confidence_score: output.confidence,
                        error_message: None,
                    })?;
                }
                Err(err) => {
                    let end = Utc::now();
                    state.record.add_processing_stage(StageRecord {
                        stage_name: stage.name.to_string(),
                        status: StageStatus::Failed,
                        start_time: start,
                        end_time: Some(end),
                        duration_secs: Some((end - start).num_milliseconds() as f64 / 1000.0),
                        accuracy_score: None,
                        confidence_score: None,
                        error_message: Some(err.to_string()),
                    })?;
                    if stage.critical {
                        return Err(ProcessError::Fatal {
                            stage: stage.name,
                            source: err,
                        });
                    }
                    warn!("stage '{}' failed, continuing degraded: {err}", stage.name);
                }
            }
        }
        Ok(())
    }
}
