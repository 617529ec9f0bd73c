//! CLIP visual encoder using ONNX Runtime.
//!
//! Encodes poster images and query text into the same 512-dimensional
//! space (ViT-B/32). Both paths L2-normalize, so cosine similarity is a
//! plain dot product downstream.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tokenizers::Tokenizer;

use super::{ensure_model, l2_normalize};

/// CLIP embedding (512-dimensional vector for ViT-B/32)
pub type ClipEmbedding = Vec<f32>;

pub const CLIP_DIM: usize = 512;

/// CLIP context length in tokens.
const CONTEXT_LENGTH: usize = 77;
const START_TOKEN: i64 = 49406;
const END_TOKEN: i64 = 49407;

static VISUAL_MODEL: OnceLock<Mutex<Session>> = OnceLock::new();
static TEXT_MODEL: OnceLock<Mutex<Session>> = OnceLock::new();
static TOKENIZER: OnceLock<Tokenizer> = OnceLock::new();

/// CLIP model wrapper
pub struct ClipModel {
    _private: (),
}

impl ClipModel {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Load the visual encoder (downloads on first run).
    pub fn load(&self) -> Result<()> {
        init_visual_model()
    }

    pub fn is_ready(&self) -> bool {
        VISUAL_MODEL.get().is_some()
    }

    /// Generate embedding for an image file
    pub fn embed_image_file(&self, path: &Path) -> Result<ClipEmbedding> {
        let img = image::open(path).map_err(|e| anyhow!("Failed to load image: {}", e))?;
        self.embed_image(&img)
    }

    /// Generate embedding for a decoded image
    pub fn embed_image(&self, img: &DynamicImage) -> Result<ClipEmbedding> {
        if !self.is_ready() {
            init_visual_model()?;
        }
        run_visual_encoder(img)
    }

    /// Generate embedding for text (for text-to-image search)
    pub fn embed_text(&self, text: &str) -> Result<ClipEmbedding> {
        if TEXT_MODEL.get().is_none() {
            init_text_model()?;
        }
        run_text_encoder(text)
    }
}

impl Default for ClipModel {
    fn default() -> Self {
        Self::new()
    }
}

fn init_visual_model() -> Result<()> {
    if VISUAL_MODEL.get().is_some() {
        return Ok(());
    }

    // Qdrant's CLIP ViT-B/32 visual encoder (ONNX)
    let model_path = ensure_model(
        "clip-vit-b32-vision.onnx",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
    )?;

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)?;

    let _ = VISUAL_MODEL.set(Mutex::new(session));
    Ok(())
}

fn init_text_model() -> Result<()> {
    if TEXT_MODEL.get().is_some() {
        return Ok(());
    }

    let model_path = ensure_model(
        "clip-vit-b32-text.onnx",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx",
    )?;
    let tokenizer_path = ensure_model(
        "clip-vit-b32-tokenizer.json",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/tokenizer.json",
    )?;

    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Failed to load CLIP tokenizer: {}", e))?;
    let _ = TOKENIZER.set(tokenizer);

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)?;

    let _ = TEXT_MODEL.set(Mutex::new(session));
    Ok(())
}

/// Run the visual encoder on an image
fn run_visual_encoder(img: &DynamicImage) -> Result<ClipEmbedding> {
    const INPUT_SIZE: u32 = 224;

    let mut model = VISUAL_MODEL
        .get()
        .ok_or_else(|| anyhow!("Visual model not initialized"))?
        .lock()
        .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

    let resized = img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // CLIP normalization constants (ImageNet stats)
    let mean = [0.48145466, 0.4578275, 0.40821073];
    let std = [0.26862954, 0.26130258, 0.27577711];

    // NCHW, normalized: (pixel/255 - mean) / std
    let mut input_data = vec![0.0f32; (3 * INPUT_SIZE * INPUT_SIZE) as usize];
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;

    for y in 0..INPUT_SIZE as usize {
        for x in 0..INPUT_SIZE as usize {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            let idx = y * INPUT_SIZE as usize + x;
            input_data[idx] = ((pixel[0] as f32 / 255.0) - mean[0]) / std[0];
            input_data[plane + idx] = ((pixel[1] as f32 / 255.0) - mean[1]) / std[1];
            input_data[2 * plane + idx] = ((pixel[2] as f32 / 255.0) - mean[2]) / std[2];
        }
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = model.run(ort::inputs!["pixel_values" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    Ok(l2_normalize(embedding_data.to_vec()))
}

/// Run the text encoder on a string
fn run_text_encoder(text: &str) -> Result<ClipEmbedding> {
    let mut model = TEXT_MODEL
        .get()
        .ok_or_else(|| anyhow!("Text model not initialized"))?
        .lock()
        .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

    let input_ids = tokenize(text)?;

    let input_tensor = Tensor::from_array(([1usize, CONTEXT_LENGTH], input_ids.into_boxed_slice()))?;

    let outputs = model.run(ort::inputs!["input_ids" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    Ok(l2_normalize(embedding_data.to_vec()))
}

/// BPE-tokenize and frame to CLIP's fixed 77-token context.
fn tokenize(text: &str) -> Result<Vec<i64>> {
    let tokenizer = TOKENIZER
        .get()
        .ok_or_else(|| anyhow!("Tokenizer not initialized"))?;
    let encoding = tokenizer
        .encode(text.to_lowercase(), false)
        .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

    let mut input_ids = vec![START_TOKEN];
    input_ids.extend(
        encoding
            .get_ids()
            .iter()
            .take(CONTEXT_LENGTH - 2)
            .map(|&id| id as i64),
    );
    input_ids.push(END_TOKEN);
    input_ids.resize(CONTEXT_LENGTH, 0);

    Ok(input_ids)
}
