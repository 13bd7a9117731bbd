//! Batch processing across a directory tree.
//!
//! Walks a tree, keeps every file with a supported extension, and runs the
//! pipeline over a fixed-size worker pool. The registry and engines are
//! shared by reference; runs do not share mutable state, so one file's
//! failure never touches another's.

use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use walkdir::WalkDir;

use crate::pipeline::{detect_input_kind, Pipeline};

/// Outcome of one file inside a batch.
#[derive(Debug)]
pub struct JobRecord {
    pub path: PathBuf,
    pub success: bool,
    pub validation_passed: bool,
    pub stems_deleted: bool,
    pub error: Option<String>,
    pub duration_secs: f64,
}

/// Aggregate outcome counts for a batch run.
#[derive(Debug, Default)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub validation_passed: usize,
    pub stems_deleted: usize,
}

pub struct BatchResult {
    pub stats: BatchStats,
    pub jobs: Vec<JobRecord>,
}

/// Collect every supported file under `root`, sorted for stable ordering.
/// Derived artifacts live under `processed/`; those subtrees are never
/// re-ingested.
pub fn collect_supported_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .path()
            .components()
            .any(|c| c.as_os_str() == "processed")
        {
            continue;
        }
        if detect_input_kind(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    files
}

/// Process everything supported under `root` with `jobs` workers.
pub fn process_batch(pipeline: &Pipeline, root: &Path, jobs: usize) -> BatchResult {
    let files = collect_supported_files(root);
    if files.is_empty() {
        log::info!("no supported files under {}", root.display());
        return BatchResult {
            stats: BatchStats::default(),
            jobs: Vec::new(),
        };
    }
    log::info!("processing {} files with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .unwrap();

    // Chunked: run a chunk in parallel, collect its outcomes, move on.
    // Keeps memory bounded and the bar honest.
    let chunk_size = (jobs * 2).max(1);
    let mut records: Vec<JobRecord> = Vec::with_capacity(files.len());
    for chunk in files.chunks(chunk_size) {
        let outcomes: Vec<JobRecord> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|path| {
                    let job = run_one(pipeline, path);
                    pb.inc(1);
                    job
                })
                .collect()
        });
        records.extend(outcomes);
    }

    let stats = summarize(&records);
    pb.finish_with_message(format!(
        "done: {} completed, {} failed, {} validated",
        stats.completed, stats.failed, stats.validation_passed
    ));
    BatchResult {
        stats,
        jobs: records,
    }
}

fn run_one(pipeline: &Pipeline, path: &Path) -> JobRecord {
    let started = Instant::now();
    let result = pipeline.process(path);
    if let Some(err) = &result.error {
        log::warn!("{}: {err}", path.display());
    }
    JobRecord {
        path: path.to_path_buf(),
        success: result.success,
        validation_passed: result.validation_passed,
        stems_deleted: result.stems_deleted,
        error: result.error,
        duration_secs: started.elapsed().as_secs_f64(),
    }
}

fn summarize(jobs: &[JobRecord]) -> BatchStats {
    let mut stats = BatchStats {
        total: jobs.len(),
        ..BatchStats::default()
    };
    for job in jobs {
        if job.success {
            stats.completed += 1;
        } else {
            stats.failed += 1;
        }
        if job.validation_passed {
            stats.validation_passed += 1;
        }
        if job.stems_deleted {
            stats.stems_deleted += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelRegistry;
    use crate::config::AppConfig;
    use crate::engines::{Engines, MockFeatureEngine};
    use std::fs;
    use std::sync::Arc;

    fn seed_tree(root: &Path) {
        fs::create_dir_all(root.join("sessions/deep")).unwrap();
        fs::create_dir_all(root.join("processed/stems/old")).unwrap();
        fs::write(root.join("roots.wav"), b"RIFF").unwrap();
        fs::write(root.join("sessions/deep/dub.flac"), b"fLaC").unwrap();
        fs::write(root.join("sessions/take.mid"), b"MThd").unwrap();
        fs::write(root.join("sessions/notes.txt"), b"setlist").unwrap();
        // Stale derived stem; must never be re-ingested.
        fs::write(root.join("processed/stems/old/bass.wav"), b"RIFF").unwrap();
    }

    #[test]
    fn collection_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());

        let files = collect_supported_files(dir.path());
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["roots.wav", "dub.flac", "take.mid"]);
    }

    #[test]
    fn batch_processes_every_supported_file() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());
        let pipeline = Pipeline::new(
            AppConfig::default(),
            Arc::new(ChannelRegistry::new()),
            Engines::mock(),
        );

        let result = process_batch(&pipeline, dir.path(), 2);
        assert_eq!(result.stats.total, 3);
        assert_eq!(result.stats.completed, 3);
        assert_eq!(result.stats.failed, 0);
        // Default mock accuracy validates both audio runs; symbolic input
        // always validates.
        assert_eq!(result.stats.validation_passed, 3);
        assert_eq!(result.stats.stems_deleted, 2);
        assert!(result.jobs.iter().all(|j| j.duration_secs >= 0.0));
    }

    #[test]
    fn one_failure_never_aborts_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.wav"), b"RIFF").unwrap();
        fs::write(dir.path().join("b.mid"), b"MThd").unwrap();
        let engines = Engines {
            features: Arc::new(MockFeatureEngine::failing()),
            ..Engines::mock()
        };
        let pipeline = Pipeline::new(
            AppConfig::default(),
            Arc::new(ChannelRegistry::new()),
            engines,
        );

        let result = process_batch(&pipeline, dir.path(), 1);
        assert_eq!(result.stats.total, 2);
        assert_eq!(result.stats.completed, 1);
        assert_eq!(result.stats.failed, 1);
        let failed = result.jobs.iter().find(|j| !j.success).unwrap();
        assert!(failed.path.ends_with("a.wav"));
        assert!(failed.error.is_some());
    }
}
