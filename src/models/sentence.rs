//! Sentence encoder for semantic dialog search.
//!
//! all-MiniLM-L6-v2 exported to ONNX: mean pooling over the last hidden
//! state weighted by the attention mask, then L2 normalization. Output
//! is a 384-dimensional vector.

use anyhow::{anyhow, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::sync::{Mutex, OnceLock};
use tokenizers::Tokenizer;

use super::{ensure_model, l2_normalize};

pub const SENTENCE_DIM: usize = 384;

/// The encoder truncates inputs past this many tokens.
const MAX_TOKENS: usize = 256;

static MODEL: OnceLock<Mutex<Session>> = OnceLock::new();
static TOKENIZER: OnceLock<Tokenizer> = OnceLock::new();

pub struct SentenceModel {
    _private: (),
}

impl SentenceModel {
    pub fn new() -> Self {
        Self { _private: () }
    }

    pub fn load(&self) -> Result<()> {
        init_model()
    }

    pub fn is_ready(&self) -> bool {
        MODEL.get().is_some()
    }

    /// Embed a transcript or query string into the sentence space.
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if !self.is_ready() {
            init_model()?;
        }
        run_encoder(text)
    }
}

impl Default for SentenceModel {
    fn default() -> Self {
        Self::new()
    }
}

fn init_model() -> Result<()> {
    if MODEL.get().is_some() {
        return Ok(());
    }

    let model_path = ensure_model(
        "all-minilm-l6-v2.onnx",
        "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx",
    )?;
    let tokenizer_path = ensure_model(
        "all-minilm-l6-v2-tokenizer.json",
        "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json",
    )?;

    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Failed to load sentence tokenizer: {}", e))?;
    let _ = TOKENIZER.set(tokenizer);

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)?;

    let _ = MODEL.set(Mutex::new(session));
    Ok(())
}

fn run_encoder(text: &str) -> Result<Vec<f32>> {
    let tokenizer = TOKENIZER
        .get()
        .ok_or_else(|| anyhow!("Tokenizer not initialized"))?;
    let mut model = MODEL
        .get()
        .ok_or_else(|| anyhow!("Sentence model not initialized"))?
        .lock()
        .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

    let ids: Vec<i64> = encoding
        .get_ids()
        .iter()
        .take(MAX_TOKENS)
        .map(|&id| id as i64)
        .collect();
    let mask: Vec<i64> = encoding
        .get_attention_mask()
        .iter()
        .take(MAX_TOKENS)
        .map(|&m| m as i64)
        .collect();
    let type_ids: Vec<i64> = vec![0; ids.len()];
    let seq_len = ids.len();

    let input_ids = Tensor::from_array(([1usize, seq_len], ids.into_boxed_slice()))?;
    let attention_mask =
        Tensor::from_array(([1usize, seq_len], mask.clone().into_boxed_slice()))?;
    let token_type_ids = Tensor::from_array(([1usize, seq_len], type_ids.into_boxed_slice()))?;

    let outputs = model.run(ort::inputs![
        "input_ids" => input_ids,
        "attention_mask" => attention_mask,
        "token_type_ids" => token_type_ids
    ])?;

    let hidden_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No encoder output"))?;
    // last_hidden_state: [1, seq_len, SENTENCE_DIM]
    let (_shape, hidden) = hidden_output.1.try_extract_tensor::<f32>()?;

    // Mean pooling over non-padding tokens.
    let mut pooled = vec![0.0f32; SENTENCE_DIM];
    let mut token_count = 0.0f32;
    for (t, &m) in mask.iter().enumerate() {
        if m == 0 {
            continue;
        }
        token_count += 1.0;
        let offset = t * SENTENCE_DIM;
        for d in 0..SENTENCE_DIM {
            pooled[d] += hidden[offset + d];
        }
    }
    if token_count > 0.0 {
        for v in pooled.iter_mut() {
            *v /= token_count;
        }
    }

    Ok(l2_normalize(pooled))
}
