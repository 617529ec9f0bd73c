//! Face detection and embedding.
//!
//! Two-model pipeline: UltraFace finds face boxes, ArcFace embeds each
//! crop into a 512-dimensional space. Boxes are reported in source-image
//! pixels; embeddings are L2-normalized.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use super::{ensure_model, l2_normalize};
use crate::store::BoundingBox;

pub const FACE_DIM: usize = 512;

/// A detected face with bounding box and embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Face detection model (UltraFace - lightweight and fast)
static DETECTION_MODEL: OnceLock<Mutex<Session>> = OnceLock::new();
/// Face embedding model (ArcFace - generates 512-dim embeddings)
static EMBEDDING_MODEL: OnceLock<Mutex<Session>> = OnceLock::new();

pub struct FaceModel {
    _private: (),
}

impl FaceModel {
    pub fn new() -> Self {
        Self { _private: () }
    }

    pub fn load(&self) -> Result<()> {
        init_detection_model()?;
        init_embedding_model()
    }

    pub fn is_ready(&self) -> bool {
        DETECTION_MODEL.get().is_some() && EMBEDDING_MODEL.get().is_some()
    }

    /// Detect and embed all faces in an image file.
    pub fn detect_file(&self, image_path: &Path) -> Result<Vec<DetectedFace>> {
        let img =
            image::open(image_path).map_err(|e| anyhow!("Failed to load image: {}", e))?;
        self.detect(&img)
    }

    /// Detect and embed all faces in a decoded image.
    pub fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        if !self.is_ready() {
            self.load()?;
        }

        let (orig_width, orig_height) = img.dimensions();

        let mut detection_model = DETECTION_MODEL
            .get()
            .ok_or_else(|| anyhow!("Detection model not initialized"))?
            .lock()
            .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
        let face_boxes = run_ultraface_detection(&mut detection_model, img)?;
        drop(detection_model);

        if face_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut embedding_model = EMBEDDING_MODEL
            .get()
            .ok_or_else(|| anyhow!("Embedding model not initialized"))?
            .lock()
            .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;

        let mut detected = Vec::new();
        for (bbox, confidence) in face_boxes {
            if bbox.w <= 0.0 || bbox.h <= 0.0 {
                continue;
            }

            let face_crop = crop_face(img, &bbox, orig_width, orig_height);
            let embedding = run_arcface_embedding(&mut embedding_model, &face_crop)?;

            detected.push(DetectedFace {
                bbox,
                embedding,
                confidence,
            });
        }

        Ok(detected)
    }
}

impl Default for FaceModel {
    fn default() -> Self {
        Self::new()
    }
}

fn init_detection_model() -> Result<()> {
    if DETECTION_MODEL.get().is_some() {
        return Ok(());
    }

    // UltraFace 320x240 variant: small and fast enough for poster sweeps.
    let model_path = ensure_model(
        "ultraface-320.onnx",
        "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
    )?;

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)?;

    let _ = DETECTION_MODEL.set(Mutex::new(session));
    Ok(())
}

fn init_embedding_model() -> Result<()> {
    if EMBEDDING_MODEL.get().is_some() {
        return Ok(());
    }

    let model_path = ensure_model(
        "arcface-resnet100.onnx",
        "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx",
    )?;

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)?;

    let _ = EMBEDDING_MODEL.set(Mutex::new(session));
    Ok(())
}

/// Run UltraFace detection model
fn run_ultraface_detection(
    session: &mut Session,
    img: &DynamicImage,
) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;
    const CONFIDENCE_THRESHOLD: f32 = 0.7;
    const NMS_THRESHOLD: f32 = 0.3;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(INPUT_WIDTH, INPUT_HEIGHT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, normalized to (pixel - 127) / 128
    let mut input_data = vec![0.0f32; (3 * INPUT_HEIGHT * INPUT_WIDTH) as usize];
    let plane = (INPUT_HEIGHT * INPUT_WIDTH) as usize;

    for y in 0..INPUT_HEIGHT as usize {
        for x in 0..INPUT_WIDTH as usize {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            let idx = y * INPUT_WIDTH as usize + x;
            input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
            input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
            input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
        }
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, num_anchors, 2] (background, face)
    // boxes: [1, num_anchors, 4] (x1, y1, x2, y2 normalized)
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence > CONFIDENCE_THRESHOLD {
            let x1 = (boxes_data[i * 4] * orig_width as f32).max(0.0) as f64;
            let y1 = (boxes_data[i * 4 + 1] * orig_height as f32).max(0.0) as f64;
            let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as f64;
            let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as f64;

            let bbox = BoundingBox {
                x: x1,
                y: y1,
                w: (x2 - x1).max(1.0),
                h: (y2 - y1).max(1.0),
            };

            face_boxes.push((bbox, confidence));
        }
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i]);

        for j in (i + 1)..boxes.len() {
            if suppressed[j] {
                continue;
            }
            if compute_iou(&boxes[i].0, &boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);

    let intersection = ((x2 - x1).max(0.0) * (y2 - y1).max(0.0)) as f32;
    let area_a = (a.w * a.h) as f32;
    let area_b = (b.w * b.h) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region from image with 20% padding
fn crop_face(
    img: &DynamicImage,
    bbox: &BoundingBox,
    img_width: u32,
    img_height: u32,
) -> DynamicImage {
    let padding_x = bbox.w * 0.2;
    let padding_y = bbox.h * 0.2;

    let x = (bbox.x - padding_x).max(0.0) as u32;
    let y = (bbox.y - padding_y).max(0.0) as u32;
    let w = ((bbox.w + padding_x * 2.0) as u32).min(img_width.saturating_sub(x));
    let h = ((bbox.h + padding_y * 2.0) as u32).min(img_height.saturating_sub(y));

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace embedding model
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: u32 = 112;

    let resized =
        face_img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // ArcFace normalization: (pixel - 127.5) / 127.5
    let mut input_data = vec![0.0f32; (3 * INPUT_SIZE * INPUT_SIZE) as usize];
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;

    for y in 0..INPUT_SIZE as usize {
        for x in 0..INPUT_SIZE as usize {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            let idx = y * INPUT_SIZE as usize + x;
            input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
            input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
            input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
        }
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    // The ArcFace ONNX model uses "data" as its input name.
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    Ok(l2_normalize(embedding_data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        let b = BoundingBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        assert!((compute_iou(&a, &b) - 1.0).abs() < 0.001);

        let c = BoundingBox { x: 20.0, y: 20.0, w: 10.0, h: 10.0 };
        assert!((compute_iou(&a, &c) - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let near_dup = vec![
            (BoundingBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 }, 0.9),
            (BoundingBox { x: 1.0, y: 1.0, w: 10.0, h: 10.0 }, 0.8),
            (BoundingBox { x: 50.0, y: 50.0, w: 10.0, h: 10.0 }, 0.7),
        ];
        let kept = nms(near_dup, 0.3);
        assert_eq!(kept.len(), 2);
        // Highest-confidence box survives.
        assert!((kept[0].1 - 0.9).abs() < 0.001);
    }
}
