/// Two-stage face detector on ONNX Runtime
///
/// Stage one locates faces with a single-class YOLO-style detection model,
/// stage two crops every face and runs an ArcFace-style embedding model on it.
use super::{FaceDetection, FaceDetector};
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::recognition::BoundingBox;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxDetectorConfig {
    /// Path to the face detection ONNX model file
    pub detection_model_path: String,

    /// Path to the face embedding ONNX model file
    pub embedding_model_path: String,

    /// Confidence threshold for face detections (0.0 to 1.0)
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,

    /// IoU threshold for NMS
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Maximum number of faces kept per frame
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    #[serde(default = "default_detection_input_size")]
    pub detection_input_size: u32,

    #[serde(default = "default_embedding_input_size")]
    pub embedding_input_size: u32,

    /// Execution provider preference (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    #[serde(default)]
    pub device_id: i32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_confidence() -> f32 {
    0.6
}

fn default_iou_threshold() -> f32 {
    0.4
}

fn default_max_detections() -> usize {
    50
}

fn default_detection_input_size() -> u32 {
    640
}

fn default_embedding_input_size() -> u32 {
    112
}

fn default_execution_provider() -> String {
    "CUDA".to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_inter_threads() -> usize {
    1
}

impl Default for OnnxDetectorConfig {
    fn default() -> Self {
        Self {
            detection_model_path: "models/face_detector.onnx".to_string(),
            embedding_model_path: "models/face_embedding.onnx".to_string(),
            confidence_threshold: default_confidence(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            detection_input_size: default_detection_input_size(),
            embedding_input_size: default_embedding_input_size(),
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

pub struct OnnxFaceDetector {
    config: OnnxDetectorConfig,
    detection_session: Arc<Mutex<Session>>,
    embedding_session: Arc<Mutex<Session>>,
    execution_provider: String,
}

impl OnnxFaceDetector {
    /// Load both models, falling back from TensorRT to CUDA to CPU
    pub fn load(config: OnnxDetectorConfig) -> Result<Self> {
        let (detection_session, execution_provider) =
            create_session(&config, &config.detection_model_path)?;
        let (embedding_session, embedding_provider) =
            create_session(&config, &config.embedding_model_path)?;

        tracing::info!(
            detection_model = %config.detection_model_path,
            embedding_model = %config.embedding_model_path,
            detection_provider = %execution_provider,
            embedding_provider = %embedding_provider,
            device_id = config.device_id,
            "loaded face models"
        );

        Ok(Self {
            config,
            detection_session: Arc::new(Mutex::new(detection_session)),
            embedding_session: Arc::new(Mutex::new(embedding_session)),
            execution_provider,
        })
    }

    pub fn config(&self) -> &OnnxDetectorConfig {
        &self.config
    }

    pub fn execution_provider(&self) -> &str {
        &self.execution_provider
    }

    async fn locate_faces(&self, frame: &RgbImage) -> Result<Vec<(BoundingBox, f32)>> {
        let input = preprocess(frame, self.config.detection_input_size, Scaling::UnitRange);
        let input_tensor = Value::from_array(input)?;

        let output = {
            let mut session = self.detection_session.lock().await;
            let outputs = session.run(ort::inputs![input_tensor])?;
            let output_value = outputs
                .get("output0")
                .or_else(|| outputs.get("output"))
                .or_else(|| outputs.get("boxes"))
                .context("No detection output tensor found")?;
            let (shape, data) = output_value.try_extract_tensor::<f32>()?;
            let shape: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
            Array::from_shape_vec(IxDyn(&shape), data.to_vec())?
        };

        postprocess_detection(&self.config, &output, frame.width(), frame.height())
    }

    async fn embed_face(&self, face: &RgbImage) -> Result<Vec<f32>> {
        let input = preprocess(face, self.config.embedding_input_size, Scaling::SignedRange);
        let input_tensor = Value::from_array(input)?;

        let mut session = self.embedding_session.lock().await;
        let outputs = session.run(ort::inputs![input_tensor])?;
        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .or_else(|| outputs.get("embedding"))
            .context("No embedding output tensor found")?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;

        // Expected shape: [batch, embedding_dim]
        let dim = shape.as_ref().get(1).copied().unwrap_or(0).max(0) as usize;
        if dim == 0 || data.len() < dim {
            anyhow::bail!("unexpected embedding output shape {:?}", shape.as_ref());
        }
        Ok(data[..dim].to_vec())
    }
}

#[async_trait]
impl FaceDetector for OnnxFaceDetector {
    fn id(&self) -> &'static str {
        "onnx_face"
    }

    async fn detect_faces(&self, frame: &RgbImage) -> Result<Vec<FaceDetection>> {
        let boxes = self.locate_faces(frame).await?;

        let mut detections = Vec::with_capacity(boxes.len());
        for (bbox, confidence) in boxes {
            let face = image::imageops::crop_imm(frame, bbox.x1, bbox.y1, bbox.width(), bbox.height())
                .to_image();
            match self.embed_face(&face).await {
                Ok(embedding) => detections.push(FaceDetection {
                    bbox,
                    embedding,
                    confidence,
                }),
                Err(e) => {
                    tracing::warn!(bbox = ?bbox, error = %e, "embedding extraction failed");
                }
            }
        }

        Ok(detections)
    }
}

#[derive(Debug, Clone, Copy)]
enum Scaling {
    /// [0, 1], detection models
    UnitRange,
    /// [-1, 1], ArcFace-style embedding models
    SignedRange,
}

/// Resize to `size x size` and convert to NCHW float input
fn preprocess(img: &RgbImage, size: u32, scaling: Scaling) -> Array<f32, IxDyn> {
    let resized = DynamicImage::ImageRgb8(img.clone())
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();

    let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            let value = pixel[channel] as f32;
            input[[0, channel, y as usize, x as usize]] = match scaling {
                Scaling::UnitRange => value / 255.0,
                Scaling::SignedRange => value / 127.5 - 1.0,
            };
        }
    }
    input
}

/// Decode a `[batch, 5, predictions]` output (cx, cy, w, h, confidence)
fn postprocess_detection(
    config: &OnnxDetectorConfig,
    output: &Array<f32, IxDyn>,
    frame_width: u32,
    frame_height: u32,
) -> Result<Vec<(BoundingBox, f32)>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[1] < 5 {
        anyhow::bail!("unexpected detection output shape {:?}", shape);
    }

    let scale_x = frame_width as f32 / config.detection_input_size as f32;
    let scale_y = frame_height as f32 / config.detection_input_size as f32;

    let mut boxes = Vec::new();
    for i in 0..shape[2] {
        let confidence = output[[0, 4, i]];
        if confidence < config.confidence_threshold {
            continue;
        }

        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        let x1 = ((cx - w / 2.0) * scale_x).max(0.0) as u32;
        let y1 = ((cy - h / 2.0) * scale_y).max(0.0) as u32;
        let x2 = ((cx + w / 2.0) * scale_x).max(0.0) as u32;
        let y2 = ((cy + h / 2.0) * scale_y).max(0.0) as u32;

        if let Some(bbox) = BoundingBox::new(x1, y1, x2, y2).clamp_to(frame_width, frame_height) {
            boxes.push((bbox, confidence));
        }
    }

    let mut kept = nms(boxes, config.iou_threshold);
    kept.truncate(config.max_detections);
    Ok(kept)
}

/// Greedy non-maximum suppression, highest confidence first
fn nms(mut boxes: Vec<(BoundingBox, f32)>, iou_threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep
            .iter()
            .all(|kept| iou(&kept.0, &candidate.0) < iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = if x2 > x1 && y2 > y1 {
        ((x2 - x1) as u64 * (y2 - y1) as u64) as f32
    } else {
        0.0
    };

    let union = a.area() as f32 + b.area() as f32 - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn session_builder(config: &OnnxDetectorConfig) -> Result<ort::session::builder::SessionBuilder> {
    Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")
}

/// Create an ONNX session, degrading TensorRT -> CUDA -> CPU
fn create_session(config: &OnnxDetectorConfig, model_path: &str) -> Result<(Session, String)> {
    match config.execution_provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!(model = %model_path, "attempting TensorRT");
            let result = session_builder(config)?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!(model = %model_path, error = %e, "TensorRT failed, trying CUDA");
                    try_cuda(config, model_path)
                }
            }
        }
        "CUDA" => try_cuda(config, model_path),
        _ => try_cpu(config, model_path),
    }
}

fn try_cuda(config: &OnnxDetectorConfig, model_path: &str) -> Result<(Session, String)> {
    tracing::info!(model = %model_path, "attempting CUDA");
    let result = session_builder(config)?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!(model = %model_path, error = %e, "CUDA failed, using CPU");
            try_cpu(config, model_path)
        }
    }
}

fn try_cpu(config: &OnnxDetectorConfig, model_path: &str) -> Result<(Session, String)> {
    tracing::info!(model = %model_path, "using CPU");
    let session = session_builder(config)?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load model from {}", model_path))?;
    Ok((session, "CPU".to_string()))
}
