use crate::config::ServiceConfig;
use crate::crops::{CropWriter, ReferenceImages};
use crate::detector::{DetectorPool, FaceDetector};
use crate::embedding::l2_norm;
use crate::error::{RecognitionError, RecognitionResult};
use crate::gallery::{GalleryStore, IndexCache};
use crate::pipeline::matcher::match_frame;
use crate::pipeline::sampler::VideoSource;
use crate::pipeline::worker::AnalysisWorker;
use crate::tasks::{TaskCoordinator, TaskStore};
use anyhow::Result;
use common::frame_extractor::decode_base64_image;
use common::recognition::{
    EnrollRequest, GalleryEntry, GalleryRecord, LiveMatchResponse,
};
use common::validation::{
    safe_unix_timestamp, validate_embedding, validate_id, validate_name, validate_threshold,
};
use image::RgbImage;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    node_id: String,
    gallery: Arc<IndexCache>,
    detectors: DetectorPool,
    references: ReferenceImages,
    tasks: TaskCoordinator,
    default_threshold: f32,
}

impl AppState {
    pub fn new(
        config: &ServiceConfig,
        gallery: Arc<dyn GalleryStore>,
        detector: Arc<dyn FaceDetector>,
        videos: Arc<dyn VideoSource>,
    ) -> Self {
        let gallery = Arc::new(IndexCache::new(gallery));
        let detectors = DetectorPool::new(detector, config.detector_instances);
        let crops = config
            .crop_dir
            .as_ref()
            .map(CropWriter::new)
            .unwrap_or_else(CropWriter::disabled);

        let references = config
            .reference_dir
            .as_ref()
            .map(ReferenceImages::new)
            .unwrap_or_else(ReferenceImages::disabled);

        let store = TaskStore::with_retention(config.task_retention_limit);
        let worker = AnalysisWorker::new(
            store.clone(),
            Arc::clone(&gallery),
            detectors.clone(),
            videos,
            crops,
            config.max_consecutive_read_failures,
        );

        Self {
            inner: Arc::new(AppStateInner {
                node_id: config.node_id.clone(),
                gallery,
                detectors,
                references,
                tasks: TaskCoordinator::new(store, worker, config.defaults),
                default_threshold: config.defaults.threshold,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn tasks(&self) -> &TaskCoordinator {
        &self.inner.tasks
    }

    pub fn gallery(&self) -> &Arc<IndexCache> {
        &self.inner.gallery
    }

    pub fn detectors(&self) -> &DetectorPool {
        &self.inner.detectors
    }

    /// Match every face in one live frame against the current gallery
    pub async fn match_single_frame(
        &self,
        frame: &RgbImage,
        threshold: Option<f32>,
    ) -> RecognitionResult<LiveMatchResponse> {
        let threshold = threshold.unwrap_or(self.inner.default_threshold);
        validate_threshold(threshold).map_err(RecognitionError::invalid_parameter)?;

        let index = self.inner.gallery.current().await?;
        let faces = self.inner.detectors.detect(frame).await?;
        let detections = match_frame(&faces, 0.0, &index, threshold)?;

        for detection in &detections {
            let outcome = if detection.recognized { "recognized" } else { "unknown" };
            telemetry::metrics::RECOGNITION_FACES_MATCHED
                .with_label_values(&["live", outcome])
                .inc();
        }

        Ok(LiveMatchResponse {
            detections,
            gallery_size: index.len(),
        })
    }

    /// Decode a base64 frame (data URL prefix allowed) and match it
    pub async fn match_encoded_frame(
        &self,
        image_data: &str,
        threshold: Option<f32>,
    ) -> RecognitionResult<LiveMatchResponse> {
        let frame = decode_image(image_data)?;
        let result = self.match_single_frame(&frame, threshold).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        telemetry::metrics::RECOGNITION_LIVE_REQUESTS
            .with_label_values(&[status])
            .inc();
        result
    }

    /// Add or replace an identity
    ///
    /// The embedding comes from the request or, failing that, from the first
    /// face detected in the supplied image. An image enrollment keeps the
    /// image as the identity's reference.
    pub async fn enroll(&self, request: EnrollRequest) -> RecognitionResult<GalleryEntry> {
        validate_name(&request.display_name, "display_name")
            .map_err(RecognitionError::invalid_parameter)?;
        validate_name(&request.group_label, "group_label")
            .map_err(RecognitionError::invalid_parameter)?;

        let identity_id = match request.identity_id {
            Some(id) => {
                validate_id(&id, "identity_id").map_err(RecognitionError::invalid_parameter)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let (embedding, image) = match (request.embedding, request.image_data) {
            (Some(embedding), _) => (embedding, None),
            (None, Some(image_data)) => {
                let image = decode_image(&image_data)?;
                let faces = self.inner.detectors.detect(&image).await?;
                let embedding = faces
                    .into_iter()
                    .next()
                    .map(|face| face.embedding)
                    .ok_or_else(|| {
                        RecognitionError::InvalidEmbedding("no face found in image".to_string())
                    })?;
                (embedding, Some(image))
            }
            (None, None) => {
                return Err(RecognitionError::invalid_parameter(
                    "either embedding or image_data is required",
                ))
            }
        };

        validate_embedding(&embedding)
            .map_err(|e| RecognitionError::InvalidEmbedding(e.to_string()))?;
        if l2_norm(&embedding) == 0.0 {
            return Err(RecognitionError::InvalidEmbedding(
                "embedding has zero norm".to_string(),
            ));
        }

        let reference_image_path = match image {
            Some(image) => self.inner.references.save(&identity_id, image).await,
            None => None,
        };

        let record = GalleryRecord {
            identity_id,
            display_name: request.display_name,
            group_label: request.group_label,
            embedding,
            reference_image_path,
            enrolled_at: safe_unix_timestamp(),
        };
        let entry = GalleryEntry::from(&record);

        // The store checks the dimension under its own write lock
        let replaced = match self.inner.gallery.store().insert(record).await {
            Ok(replaced) => replaced,
            Err(e) => {
                if let Some(path) = &entry.reference_image_path {
                    self.inner.references.remove(path).await;
                }
                return Err(store_error(e));
            }
        };

        if let Some(old) = replaced.and_then(|r| r.reference_image_path) {
            if entry.reference_image_path.as_ref() != Some(&old) {
                self.inner.references.remove(&old).await;
            }
        }

        info!(
            identity_id = %entry.identity_id,
            group_label = %entry.group_label,
            dimension = entry.dimension,
            reference_image = ?entry.reference_image_path,
            "identity enrolled"
        );
        Ok(entry)
    }

    /// Returns false when the identity was not enrolled
    pub async fn remove_identity(&self, identity_id: &str) -> RecognitionResult<bool> {
        let removed = self
            .inner
            .gallery
            .store()
            .remove(identity_id)
            .await
            .map_err(store_error)?;

        let Some(record) = removed else {
            return Ok(false);
        };
        if let Some(path) = &record.reference_image_path {
            self.inner.references.remove(path).await;
        }
        info!(identity_id, "identity removed");
        Ok(true)
    }

    pub async fn list_gallery(&self) -> RecognitionResult<Vec<GalleryEntry>> {
        let index = self.inner.gallery.current().await?;
        Ok(index.records().iter().map(GalleryEntry::from).collect())
    }

    /// Detector healthy and gallery reachable
    pub async fn ready(&self) -> bool {
        self.inner.detectors.health_check().await && self.inner.gallery.current().await.is_ok()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.inner.tasks.shutdown().await;
        Ok(())
    }
}

/// Keep dimension conflicts typed; anything else means the store is unavailable
fn store_error(err: anyhow::Error) -> RecognitionError {
    match err.downcast::<RecognitionError>() {
        Ok(err) => err,
        Err(err) => RecognitionError::gallery(format!("{:#}", err)),
    }
}

fn decode_image(image_data: &str) -> RecognitionResult<RgbImage> {
    let bytes = decode_base64_image(image_data)
        .map_err(|e| RecognitionError::invalid_parameter(format!("{:#}", e)))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| RecognitionError::invalid_parameter(format!("failed to decode image: {}", e)))?;
    Ok(image.to_rgb8())
}
