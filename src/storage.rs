//! On-disk layout for pipeline artifacts.
//!
//! Everything a run produces lands under `<output_root>/processed/`:
//!
//! ```text
//! processed/
//!   stems/<track>/<stem>.wav          isolated stems (until cleanup)
//!   <track>.converted.json            note events straight from conversion
//!   <track>.standardized.json         note events on canonical channels
//!   metadata/<track>.metadata.json    the metadata record
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::metadata::types::{FileKind, FileReference};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Track name used for every artifact: the source file's stem.
pub fn track_name(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

pub fn processed_dir(output_root: &Path) -> PathBuf {
    output_root.join("processed")
}

pub fn stems_dir(output_root: &Path, track: &str) -> PathBuf {
    processed_dir(output_root).join("stems").join(track)
}

pub fn converted_notes_path(output_root: &Path, track: &str) -> PathBuf {
    processed_dir(output_root).join(format!("{track}.converted.json"))
}

pub fn standardized_notes_path(output_root: &Path, track: &str) -> PathBuf {
    processed_dir(output_root).join(format!("{track}.standardized.json"))
}

pub fn metadata_dir(output_root: &Path) -> PathBuf {
    processed_dir(output_root).join("metadata")
}

pub fn metadata_path(output_root: &Path, track: &str) -> PathBuf {
    metadata_dir(output_root).join(format!("{track}.metadata.json"))
}

/// Write a value as pretty JSON, creating parent directories as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

/// SHA-256 hex digest of a file's contents.
pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Build a file reference for an artifact. Size and checksum are best-effort:
/// a file that cannot be read still gets tracked, with size 0 and no digest.
pub fn file_reference(record_id: &str, role: &str, kind: FileKind, path: &Path) -> FileReference {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or_else(|err| {
        debug!("could not stat {}: {err}", path.display());
        0
    });
    let checksum = match checksum_file(path) {
        Ok(digest) => Some(digest),
        Err(err) => {
            debug!("could not hash {}: {err}", path.display());
            None
        }
    };
    FileReference {
        id: format!("{record_id}:{role}"),
        kind,
        path: path.to_path_buf(),
        size,
        checksum,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_artifacts_under_processed() {
        let root = Path::new("/out");
        assert_eq!(
            stems_dir(root, "dub_session"),
            Path::new("/out/processed/stems/dub_session")
        );
        assert_eq!(
            converted_notes_path(root, "dub_session"),
            Path::new("/out/processed/dub_session.converted.json")
        );
        assert_eq!(
            standardized_notes_path(root, "dub_session"),
            Path::new("/out/processed/dub_session.standardized.json")
        );
        assert_eq!(
            metadata_path(root, "dub_session"),
            Path::new("/out/processed/metadata/dub_session.metadata.json")
        );
    }

    #[test]
    fn track_name_uses_file_stem() {
        assert_eq!(track_name(Path::new("/music/roots.wav")), "roots");
        assert_eq!(track_name(Path::new("/music/roots.take2.wav")), "roots.take2");
        assert_eq!(track_name(Path::new("/")), "unnamed");
    }

    #[test]
    fn file_reference_hashes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        fs::write(&path, b"RIFF....WAVE").unwrap();

        let reference = file_reference("rec-1", "source", FileKind::SourceAudio, &path);
        assert_eq!(reference.id, "rec-1:source");
        assert_eq!(reference.size, 12);
        let digest = reference.checksum.unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn file_reference_tolerates_missing_files() {
        let reference = file_reference(
            "rec-1",
            "source",
            FileKind::SourceAudio,
            Path::new("/nonexistent/take.wav"),
        );
        assert_eq!(reference.size, 0);
        assert_eq!(reference.checksum, None);
    }

    #[test]
    fn write_json_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/doc.json");
        write_json(&path, &serde_json::json!({"ok": true})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"ok\": true"));
    }
}
