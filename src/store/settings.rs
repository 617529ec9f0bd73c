//! The runtime config table.
//!
//! Structured values (JSON) keyed by name: indexer state, poll interval,
//! watch folders, model toggles, the model version registry, poster and
//! threshold settings, and the published scan progress. Both processes
//! read these; the ingest process and admin actions write them.

use anyhow::Result;
use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::Store;

pub const KEY_INDEXER_STATE: &str = "indexer_state";
pub const KEY_POLL_INTERVAL: &str = "poll_interval_seconds";
pub const KEY_WATCH_FOLDERS: &str = "watch_folders";
pub const KEY_ENRICHMENT_MODELS: &str = "enrichment_models";
pub const KEY_MODEL_VERSIONS: &str = "model_versions";
pub const KEY_POSTER_WIDTH: &str = "poster_width";
pub const KEY_POSTER_QUALITY: &str = "poster_quality";
pub const KEY_POSTER_FORMAT: &str = "poster_format";
pub const KEY_SCENE_THRESHOLD: &str = "scene_threshold";
pub const KEY_THRESHOLD_VISUAL: &str = "search_threshold_visual";
pub const KEY_THRESHOLD_VISUAL_MATCH: &str = "search_threshold_visual_match";
pub const KEY_THRESHOLD_FACE: &str = "search_threshold_face";
pub const KEY_THRESHOLD_TRANSCRIPT: &str = "search_threshold_transcript";
pub const KEY_SCAN_PROGRESS: &str = "scan_progress";
pub const KEY_LAST_SCAN_AT: &str = "last_scan_at";
pub const KEY_LAST_SCAN_DURATION_MS: &str = "last_scan_duration_ms";

/// Per-model version + dimension, from the `model_versions` registry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelVersion {
    pub version: String,
    #[serde(default)]
    pub dimension: Option<i64>,
}

/// Which enrichment models are switched on.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct EnabledModels {
    #[serde(default = "default_true")]
    pub clip: bool,
    #[serde(default = "default_true")]
    pub whisper: bool,
    #[serde(default = "default_true")]
    pub arcface: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EnabledModels {
    fn default() -> Self {
        Self {
            clip: true,
            whisper: true,
            arcface: true,
        }
    }
}

impl Store {
    /// Raw config value, if set.
    pub fn get_config(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM config WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn set_config(&self, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, json],
        )?;
        Ok(())
    }

    /// Typed read with a fallback default.
    pub fn get_config_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.get_config(key)? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or(default)),
            None => Ok(default),
        }
    }

    pub fn set_config_value<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_config(key, &serde_json::to_value(value)?)
    }

    // Convenience accessors for the well-known keys.

    pub fn indexer_state(&self) -> Result<String> {
        self.get_config_or(KEY_INDEXER_STATE, "running".to_string())
    }

    pub fn poll_interval_seconds(&self) -> Result<u64> {
        self.get_config_or(KEY_POLL_INTERVAL, 3600u64)
    }

    pub fn watch_folders(&self) -> Result<Vec<String>> {
        self.get_config_or(KEY_WATCH_FOLDERS, Vec::new())
    }

    pub fn enabled_models(&self) -> Result<EnabledModels> {
        self.get_config_or(KEY_ENRICHMENT_MODELS, EnabledModels::default())
    }

    /// The model registry: name -> {version, dimension}. Missing entries
    /// fall back to the built-in defaults so a fresh database works.
    pub fn model_versions(&self) -> Result<BTreeMap<String, ModelVersion>> {
        let mut registry: BTreeMap<String, ModelVersion> =
            self.get_config_or(KEY_MODEL_VERSIONS, BTreeMap::new())?;
        for (name, version, dimension) in [
            ("clip", "ViT-B-32", Some(512)),
            ("transcript", "all-MiniLM-L6-v2", Some(384)),
            ("whisper", "base", None),
            ("arcface", "arcface-resnet100", Some(512)),
        ] {
            registry.entry(name.to_string()).or_insert(ModelVersion {
                version: version.to_string(),
                dimension,
            });
        }
        Ok(registry)
    }

    pub fn poster_width(&self) -> Result<u32> {
        self.get_config_or(KEY_POSTER_WIDTH, 1280u32)
    }

    pub fn poster_quality(&self) -> Result<u32> {
        self.get_config_or(KEY_POSTER_QUALITY, 80u32)
    }

    pub fn poster_format(&self) -> Result<String> {
        self.get_config_or(KEY_POSTER_FORMAT, "webp".to_string())
    }

    /// Scene-cut sensitivity on the detector's 0-100 scale.
    pub fn scene_threshold(&self) -> Result<f64> {
        self.get_config_or(KEY_SCENE_THRESHOLD, 27.0f64)
    }

    pub fn search_thresholds(&self) -> Result<SearchThresholds> {
        Ok(SearchThresholds {
            visual: self.get_config_or(KEY_THRESHOLD_VISUAL, 0.10f32)?,
            visual_match: self.get_config_or(KEY_THRESHOLD_VISUAL_MATCH, 0.20f32)?,
            face: self.get_config_or(KEY_THRESHOLD_FACE, 0.25f32)?,
            transcript: self.get_config_or(KEY_THRESHOLD_TRANSCRIPT, 0.35f32)?,
        })
    }
}

/// Default minimum similarities per search clause kind.
#[derive(Debug, Clone, Copy)]
pub struct SearchThresholds {
    pub visual: f32,
    pub visual_match: f32,
    pub face: f32,
    pub transcript: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_roundtrip() {
        let s = Store::open_in_memory().unwrap();
        assert!(s.get_config("poll_interval_seconds").unwrap().is_none());

        s.set_config_value(KEY_POLL_INTERVAL, &600u64).unwrap();
        assert_eq!(s.poll_interval_seconds().unwrap(), 600);

        // Overwrite in place.
        s.set_config_value(KEY_POLL_INTERVAL, &120u64).unwrap();
        assert_eq!(s.poll_interval_seconds().unwrap(), 120);
    }

    #[test]
    fn test_defaults() {
        let s = Store::open_in_memory().unwrap();
        assert_eq!(s.indexer_state().unwrap(), "running");
        assert_eq!(s.poll_interval_seconds().unwrap(), 3600);
        assert!(s.watch_folders().unwrap().is_empty());
        assert_eq!(s.poster_width().unwrap(), 1280);
        assert_eq!(s.poster_quality().unwrap(), 80);
        assert_eq!(s.poster_format().unwrap(), "webp");

        let models = s.enabled_models().unwrap();
        assert!(models.clip && models.whisper && models.arcface);

        let thresholds = s.search_thresholds().unwrap();
        assert!((thresholds.face - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_model_registry_defaults_merge() {
        let s = Store::open_in_memory().unwrap();
        s.set_config_value(
            KEY_MODEL_VERSIONS,
            &serde_json::json!({"clip": {"version": "ViT-L-14", "dimension": 768}}),
        )
        .unwrap();

        let registry = s.model_versions().unwrap();
        assert_eq!(registry["clip"].version, "ViT-L-14");
        assert_eq!(registry["clip"].dimension, Some(768));
        // Unmentioned models keep their defaults.
        assert_eq!(registry["transcript"].dimension, Some(384));
    }
}
