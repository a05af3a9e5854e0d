//! Configuration loading for auris services
//!
//! Resolution order for every field: environment variable → TOML file →
//! built-in default. Environment overrides exist so deployments can adjust a
//! single value without editing the config file.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What to do when a file's output already exists at the final location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Re-render and atomically replace the existing output (default)
    #[default]
    Overwrite,
    /// Keep the existing output and mark the file succeeded without work
    Skip,
}

/// Service configuration
///
/// All fields have working defaults; an absent config file is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AurisConfig {
    /// HTTP listen address
    pub bind_addr: String,
    /// Root directory for the database, uploads and outputs
    pub data_dir: PathBuf,
    /// Number of concurrent job workers
    pub workers: usize,
    /// In-memory replay tail kept per job for snapshot queries
    pub replay_tail: usize,
    /// ffmpeg executable (convert / filter / encode collaborator)
    pub ffmpeg_path: String,
    /// ffprobe executable (input probing)
    pub ffprobe_path: String,
    /// External denoiser command template; `{model}` is replaced with the
    /// model variant, `{input}` / `{output}` with WAV paths
    pub denoiser_command: Option<String>,
    /// Behavior when an output file already exists
    pub overwrite: OverwritePolicy,
}

impl Default for AurisConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("data"),
            workers: 1,
            replay_tail: 256,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            denoiser_command: None,
            overwrite: OverwritePolicy::Overwrite,
        }
    }
}

impl AurisConfig {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides.
    ///
    /// A missing file yields the defaults; a malformed file is an error (a
    /// half-read config is worse than none).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                let config: AurisConfig = toml::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                info!(path = %path.display(), "Configuration loaded");
                config
            }
            Some(path) => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                AurisConfig::default()
            }
            None => AurisConfig::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AURIS_*` environment variables over the loaded values
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("AURIS_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("AURIS_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(workers) = std::env::var("AURIS_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| Error::Config(format!("AURIS_WORKERS is not a number: {workers}")))?;
        }
        if let Ok(tail) = std::env::var("AURIS_REPLAY_TAIL") {
            self.replay_tail = tail
                .parse()
                .map_err(|_| Error::Config(format!("AURIS_REPLAY_TAIL is not a number: {tail}")))?;
        }
        if let Ok(path) = std::env::var("AURIS_FFMPEG") {
            self.ffmpeg_path = path;
        }
        if let Ok(path) = std::env::var("AURIS_FFPROBE") {
            self.ffprobe_path = path;
        }
        if let Ok(cmd) = std::env::var("AURIS_DENOISER_COMMAND") {
            self.denoiser_command = Some(cmd);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.replay_tail == 0 {
            return Err(Error::Config("replay_tail must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("auris.db")
    }

    /// Root of per-job upload directories
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Root of per-job output directories
    pub fn outputs_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AurisConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.overwrite, OverwritePolicy::Overwrite);
        assert!(config.database_path().ends_with("auris.db"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auris.toml");
        std::fs::write(&path, "workers = 4\nbind_addr = \"0.0.0.0:9000\"\n").expect("write");

        let config = AurisConfig::load(Some(&path)).expect("load");
        assert_eq!(config.workers, 4);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        // Unspecified fields keep defaults
        assert_eq!(config.replay_tail, 256);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = AurisConfig::load(Some(Path::new("/nonexistent/auris.toml"))).expect("load");
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auris.toml");
        std::fs::write(&path, "workers = 0\n").expect("write");

        assert!(AurisConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn overwrite_policy_parses_from_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auris.toml");
        std::fs::write(&path, "overwrite = \"skip\"\n").expect("write");

        let config = AurisConfig::load(Some(&path)).expect("load");
        assert_eq!(config.overwrite, OverwritePolicy::Skip);
    }
}
