use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Directories to process (used when `batch` has no CLI argument).
    pub music_dirs: Vec<PathBuf>,
    /// Root for derived artifacts. Unset = next to each input file.
    pub output_root: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Wall-clock bound on stem separation, in seconds. 0 = unbounded.
    pub separation_timeout_secs: u64,
    /// Keep separated stems even when conversion validates.
    pub keep_stems: bool,
}

impl AppConfig {
    /// Load config from `~/.config/dubwise/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        match toml::from_str::<AppConfig>(&contents) {
                            Ok(config) => {
                                log::info!("Loaded config from {}", path.display());
                                config
                            }
                            Err(e) => {
                                log::warn!(
                                    "Failed to parse {}: {}. Using defaults.",
                                    path.display(),
                                    e
                                );
                                Self::default()
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to read {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                }
            }
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            workers = 4
            keep_stems = true
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert!(config.keep_stems);
        assert!(config.music_dirs.is_empty());
        assert_eq!(config.output_root, None);
        assert_eq!(config.separation_timeout_secs, 0);
    }

    #[test]
    fn explicit_workers_win_over_autodetect() {
        let config = AppConfig {
            workers: 3,
            ..AppConfig::default()
        };
        assert_eq!(config.resolve_workers(), 3);
        assert!(AppConfig::default().resolve_workers() >= 1);
    }
}
