//! Model hosts.
//!
//! Four transforms behind a uniform contract: lazy load on first use,
//! `ready()` to advertise state, and a pure transform call. Sessions
//! live in process-wide statics guarded by mutexes; the pipeline
//! serializes its calls, the query process owns its own copies.

pub mod arcface;
pub mod clip;
pub mod sentence;
pub mod whisper;

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};

static MODELS_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Set the directory model files are cached in. Must be called before
/// the first host load; later calls are ignored.
pub fn set_models_dir(dir: PathBuf) {
    let _ = MODELS_DIR.set(dir);
}

/// The models cache directory, created on demand.
pub(crate) fn models_dir() -> Result<PathBuf> {
    let dir = match MODELS_DIR.get() {
        Some(dir) => dir.clone(),
        None => dirs::data_local_dir()
            .ok_or_else(|| anyhow!("Could not find local data directory"))?
            .join("fennec")
            .join("models"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Download a model file if it doesn't exist.
pub(crate) fn ensure_model(filename: &str, url: &str) -> Result<PathBuf> {
    let models_dir = models_dir()?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        let mut file = std::fs::File::create(&model_path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

/// L2-normalize in place so cosine similarity reduces to dot product.
pub(crate) fn l2_normalize(embedding: Vec<f32>) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter().map(|x| x / norm).collect()
    } else {
        embedding
    }
}

/// Which query-side hosts are currently loaded. The read surface gates
/// semantic features on these flags instead of blocking on loads.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Readiness {
    pub clip_loaded: bool,
    pub sentence_loaded: bool,
}

impl Readiness {
    pub fn current() -> Self {
        Self {
            clip_loaded: clip::ClipModel::new().is_ready(),
            sentence_loaded: sentence::SentenceModel::new().is_ready(),
        }
    }

    pub fn models_ready(&self) -> bool {
        self.clip_loaded && self.sentence_loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 0.0001);
        assert!((v[1] - 0.8).abs() < 0.0001);

        // Zero vector passes through untouched.
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
