//! Stem retention policy.
//!
//! Stems are intermediate artifacts: once note conversion has been validated
//! they no longer earn their disk space. They are deleted only when the run
//! demonstrated it can stand on the converted note events, i.e. conversion
//! accuracy reached the crate-wide threshold. A run with no accuracy score
//! keeps its stems, always.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// True when the pipeline should delete isolated stems.
pub fn should_delete_stems(accuracy: Option<f64>, has_stems: bool) -> bool {
    has_stems && matches!(accuracy, Some(a) if a >= crate::ACCURACY_THRESHOLD)
}

/// Delete stem files one by one, best effort. A file that is already gone
/// counts as deleted (the operation is idempotent); any other failure is
/// logged and skipped. Returns the number of stems no longer on disk.
pub fn delete_stem_files(stems: &BTreeMap<String, PathBuf>, stems_dir: &Path) -> usize {
    let mut deleted = 0;
    for (stem, path) in stems {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("deleted stem '{stem}' at {}", path.display());
                deleted += 1;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("stem '{stem}' already gone at {}", path.display());
                deleted += 1;
            }
            Err(err) => {
                warn!("could not delete stem '{stem}' at {}: {err}", path.display());
            }
        }
    }
    // Drop the directory too once it is empty; harmless to fail.
    if let Err(err) = fs::remove_dir(stems_dir) {
        debug!("stems dir {} not removed: {err}", stems_dir.display());
    }
    deleted
}
