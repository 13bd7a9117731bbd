pub mod batch;
pub mod channels;
pub mod config;
pub mod engines;
pub mod metadata;
pub mod notes;
pub mod pipeline;
pub mod storage;
pub mod tone;
pub mod training;

/// Audio file extensions accepted by the recording branch
pub const SUPPORTED_AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "aac", "ogg", "m4a"];

/// Note-event file extensions accepted by the symbolic branch
pub const SUPPORTED_NOTE_EXTENSIONS: &[&str] = &["mid", "midi"];

/// Conversion accuracy at or above this validates a run; validated runs
/// may drop their intermediate stems.
pub const ACCURACY_THRESHOLD: f64 = 0.85;

/// Application name for XDG paths
pub const APP_NAME: &str = "dubwise";
