//! Speech-to-text via whisper.cpp.
//!
//! Takes 16 kHz mono f32 samples (the audio extractor's output format)
//! and yields timestamped segments for the transcript stage to map onto
//! scenes.

use anyhow::{anyhow, Result};
use std::sync::{Mutex, OnceLock};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::ensure_model;

/// One transcribed span of speech.
#[derive(Debug, Clone)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

static CONTEXT: OnceLock<Mutex<WhisperContext>> = OnceLock::new();

pub struct WhisperModel {
    _private: (),
}

impl WhisperModel {
    pub fn new() -> Self {
        Self { _private: () }
    }

    pub fn load(&self) -> Result<()> {
        init_context()
    }

    pub fn is_ready(&self) -> bool {
        CONTEXT.get().is_some()
    }

    /// Transcribe 16 kHz mono samples. Returns segments in time order;
    /// empty when no speech was detected.
    pub fn transcribe(&self, samples: &[f32]) -> Result<Vec<TranscriptSegment>> {
        if !self.is_ready() {
            init_context()?;
        }
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let context = CONTEXT
            .get()
            .ok_or_else(|| anyhow!("Whisper context not initialized"))?
            .lock()
            .map_err(|e| anyhow!("Failed to lock whisper context: {}", e))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(4);
        params.set_translate(false);
        params.set_token_timestamps(true);
        params.set_print_progress(false);
        params.set_print_realtime(false);

        let mut state = context
            .create_state()
            .map_err(|e| anyhow!("Failed to create whisper state: {}", e))?;
        state
            .full(params, samples)
            .map_err(|e| anyhow!("Transcription failed: {}", e))?;

        let mut segments = Vec::new();
        for segment in state.as_iter() {
            let text = segment.to_string().trim().to_string();
            if text.is_empty() {
                continue;
            }
            // Timestamps arrive in centiseconds.
            segments.push(TranscriptSegment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text,
            });
        }

        Ok(segments)
    }
}

impl Default for WhisperModel {
    fn default() -> Self {
        Self::new()
    }
}

fn init_context() -> Result<()> {
    if CONTEXT.get().is_some() {
        return Ok(());
    }

    // whisper.cpp ggml weights, base multilingual model.
    let model_path = ensure_model(
        "ggml-base.bin",
        "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
    )?;

    let path_str = model_path
        .to_str()
        .ok_or_else(|| anyhow!("Invalid model path encoding"))?;
    let context = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
        .map_err(|e| anyhow!("Failed to load whisper model: {}", e))?;

    let _ = CONTEXT.set(Mutex::new(context));
    Ok(())
}
