pub mod onnx;
pub mod scripted;

pub use onnx::{OnnxDetectorConfig, OnnxFaceDetector};
pub use scripted::ScriptedDetector;

use crate::error::{RecognitionError, RecognitionResult};
use anyhow::Result;
use async_trait::async_trait;
use common::recognition::BoundingBox;
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// A face found in a frame together with its raw embedding
#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    /// Detector confidence in [0, 1]
    pub confidence: f32,
}

impl FaceDetection {
    pub fn new(bbox: BoundingBox, embedding: Vec<f32>) -> Self {
        Self {
            bbox,
            embedding,
            confidence: 1.0,
        }
    }
}

/// Face detection and embedding model
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Short identifier used in logs and metric labels
    fn id(&self) -> &'static str;

    async fn detect_faces(&self, frame: &RgbImage) -> Result<Vec<FaceDetection>>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Bounds concurrent calls into a detector to the number of model instances
#[derive(Clone)]
pub struct DetectorPool {
    detector: Arc<dyn FaceDetector>,
    permits: Arc<Semaphore>,
    instances: usize,
}

impl DetectorPool {
    pub fn new(detector: Arc<dyn FaceDetector>, instances: usize) -> Self {
        let instances = instances.max(1);
        Self {
            detector,
            permits: Arc::new(Semaphore::new(instances)),
            instances,
        }
    }

    pub fn detector_id(&self) -> &'static str {
        self.detector.id()
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    pub async fn detect(&self, frame: &RgbImage) -> RecognitionResult<Vec<FaceDetection>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RecognitionError::detector("detector pool closed"))?;

        let start = Instant::now();
        let result = self.detector.detect_faces(frame).await;
        telemetry::metrics::RECOGNITION_DETECTION_LATENCY
            .with_label_values(&[self.detector.id()])
            .observe(start.elapsed().as_secs_f64());

        result.map_err(|e| RecognitionError::detector(format!("{:#}", e)))
    }

    pub async fn health_check(&self) -> bool {
        match self.detector.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                tracing::warn!(detector = self.detector.id(), error = %e, "detector health check failed");
                false
            }
        }
    }
}
