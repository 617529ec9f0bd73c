//! Process-level configuration.
//!
//! Paths and service settings that must exist before the store is open
//! live here, loaded from a TOML file. Everything switchable at runtime
//! (indexer state, watch folders, model toggles, thresholds) lives in
//! the store's `config` table instead; see [`crate::store::settings`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory poster frames are written to and served from.
    #[serde(default = "default_posters_dir")]
    pub posters_dir: PathBuf,

    /// Directory downloaded model files are cached in.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Jobs stuck in `processing` longer than this are reclaimed at startup.
    #[serde(default = "default_stuck_job_timeout_minutes")]
    pub stuck_job_timeout_minutes: u64,

    /// Wait between claim attempts after a model host fails to load.
    #[serde(default = "default_model_backoff_seconds")]
    pub model_backoff_seconds: u64,

    /// Sleep granularity of the scheduler loop, so pause/resume and poll
    /// interval changes are noticed without a full interval passing.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

fn default_stuck_job_timeout_minutes() -> u64 {
    30
}

fn default_model_backoff_seconds() -> u64 {
    60
}

fn default_tick_seconds() -> u64 {
    10
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stuck_job_timeout_minutes: default_stuck_job_timeout_minutes(),
            model_backoff_seconds: default_model_backoff_seconds(),
            tick_seconds: default_tick_seconds(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fennec")
        .join("fennec.db")
}

fn default_posters_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fennec")
        .join("posters")
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fennec")
        .join("models")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            posters_dir: default_posters_dir(),
            models_dir: default_models_dir(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fennec")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FENNEC_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.ingest.tick_seconds, 10);

        // Round-trips through the file it just wrote.
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.db_path, config.db_path);
    }
}
