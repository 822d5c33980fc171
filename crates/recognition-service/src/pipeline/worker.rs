//! Runs one video analysis job
//!
//! Decoding happens on a blocking thread that feeds sampled frames through a
//! small bounded channel. The async side detects, matches and tracks each
//! frame in timestamp order and publishes progress to the task store.

use super::aggregator::{aggregate, FrameCounts};
use super::matcher::match_frame;
use super::sampler::{FrameSampler, SampledFrame, VideoSource};
use super::tracker::{AppearanceTracker, ClosedAppearance, Sighting};
use crate::crops::CropWriter;
use crate::detector::DetectorPool;
use crate::error::{RecognitionError, RecognitionResult};
use crate::gallery::{GalleryIndex, IndexCache};
use crate::tasks::TaskStore;
use common::recognition::{AnalysisParameters, AnalysisReport, AppearanceEvent, BoundingBox};
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Sampled frames buffered between the decoder thread and the worker
const FRAME_QUEUE_CAPACITY: usize = 2;

/// A submitted analysis
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub task_id: String,
    pub video_reference: String,
    pub parameters: AnalysisParameters,
}

enum DecodeEvent {
    Opened { expected_samples: Option<u64> },
    Frame { frame: SampledFrame, skipped: u64 },
    Finished { skipped: u64 },
}

type Crop = Option<RgbImage>;

#[derive(Clone)]
pub struct AnalysisWorker {
    tasks: TaskStore,
    gallery: Arc<IndexCache>,
    detectors: DetectorPool,
    videos: Arc<dyn VideoSource>,
    crops: CropWriter,
    max_consecutive_failures: u32,
}

impl AnalysisWorker {
    pub fn new(
        tasks: TaskStore,
        gallery: Arc<IndexCache>,
        detectors: DetectorPool,
        videos: Arc<dyn VideoSource>,
        crops: CropWriter,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            tasks,
            gallery,
            detectors,
            videos,
            crops,
            max_consecutive_failures,
        }
    }

    /// Drive `job` to a terminal status
    pub async fn run(&self, job: AnalysisJob, cancel: CancellationToken) {
        let span = info_span!("analysis", task_id = %job.task_id);
        async move {
            if !self.tasks.mark_running(&job.task_id).await {
                debug!("task left the queue before starting");
                return;
            }

            info!(
                video = %job.video_reference,
                threshold = job.parameters.threshold,
                interval_secs = job.parameters.sampling_interval_secs(),
                exit_delay_secs = job.parameters.exit_delay_secs,
                "analysis started"
            );

            let started = Instant::now();
            let outcome = if cancel.is_cancelled() {
                Err(RecognitionError::Cancelled)
            } else {
                self.analyze(&job, &cancel).await
            };

            match outcome {
                Ok(report) => {
                    let events = report.stats.total_events;
                    let identities = report.stats.distinct_identities;
                    if self.tasks.complete(&job.task_id, report).await {
                        telemetry::metrics::RECOGNITION_ANALYSIS_OUTCOMES
                            .with_label_values(&["completed"])
                            .inc();
                        info!(events, identities, "analysis completed");
                    }
                }
                Err(e) => {
                    // Crops of events closed before the failure have no report to live in
                    self.crops.discard(&job.task_id).await;
                    if self.tasks.fail(&job.task_id, e.to_string()).await {
                        telemetry::metrics::RECOGNITION_ANALYSIS_OUTCOMES
                            .with_label_values(&["failed"])
                            .inc();
                    }
                    warn!(error = %e, "analysis failed");
                }
            }

            telemetry::metrics::RECOGNITION_ANALYSIS_DURATION
                .observe(started.elapsed().as_secs_f64());
        }
        .instrument(span)
        .await
    }

    async fn analyze(
        &self,
        job: &AnalysisJob,
        cancel: &CancellationToken,
    ) -> RecognitionResult<AnalysisReport> {
        let started = Instant::now();
        let index = self.gallery.current().await?;
        let mut tracker = AppearanceTracker::<Crop>::new(job.parameters.exit_delay_secs)?;

        let (tx, mut rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let decoder = spawn_decoder(
            Arc::clone(&self.videos),
            job.video_reference.clone(),
            job.parameters.sampling_interval_secs(),
            self.max_consecutive_failures,
            tx,
            cancel.clone(),
        );

        let mut expected_samples = None;
        let mut processed = 0u64;
        let mut decode_skipped = 0u64;
        let mut frame_skipped = 0u64;
        let mut events = Vec::new();

        let outcome: RecognitionResult<()> = loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(RecognitionError::Cancelled),
                message = rx.recv() => message,
            };

            match message {
                None => break Ok(()),
                Some(Err(e)) => break Err(e),
                Some(Ok(DecodeEvent::Opened { expected_samples: expected })) => {
                    expected_samples = expected;
                    if index.no_records() {
                        info!("gallery is empty, skipping frame analysis");
                        break Ok(());
                    }
                }
                Some(Ok(DecodeEvent::Frame { frame, skipped })) => {
                    decode_skipped = skipped;
                    if cancel.is_cancelled() {
                        break Err(RecognitionError::Cancelled);
                    }

                    let timestamp = frame.timestamp;
                    match self.process_frame(job, &index, &mut tracker, frame).await {
                        Ok(closed) => {
                            processed += 1;
                            self.finalize(&job.task_id, closed, &mut events).await;
                        }
                        Err(e @ RecognitionError::DimensionMismatch { .. }) => break Err(e),
                        Err(e) => {
                            frame_skipped += 1;
                            telemetry::metrics::RECOGNITION_FRAMES_SKIPPED
                                .with_label_values(&[skip_reason(&e)])
                                .inc();
                            warn!(timestamp, error = %e, "skipping frame");
                        }
                    }

                    self.tasks
                        .record_progress(
                            &job.task_id,
                            processed,
                            frame_skipped,
                            decode_skipped,
                            expected_samples,
                        )
                        .await;
                }
                Some(Ok(DecodeEvent::Finished { skipped })) => {
                    decode_skipped = skipped;
                    break Ok(());
                }
            }
        };

        drop(rx);
        if let Err(e) = decoder.await {
            warn!(error = %e, "decoder thread did not finish cleanly");
        }
        outcome?;

        let remaining = tracker.finish();
        self.finalize(&job.task_id, remaining, &mut events).await;

        let skipped = decode_skipped + frame_skipped;
        if decode_skipped > 0 {
            telemetry::metrics::RECOGNITION_FRAMES_SKIPPED
                .with_label_values(&["unreadable"])
                .inc_by(decode_skipped);
        }

        Ok(aggregate(
            events,
            started.elapsed().as_secs_f64(),
            FrameCounts { processed, skipped },
        ))
    }

    async fn process_frame(
        &self,
        job: &AnalysisJob,
        index: &GalleryIndex,
        tracker: &mut AppearanceTracker<Crop>,
        frame: SampledFrame,
    ) -> RecognitionResult<Vec<ClosedAppearance<Crop>>> {
        let faces = self.detectors.detect(&frame.image).await?;
        let matches = match_frame(&faces, frame.timestamp, index, job.parameters.threshold)?;

        let mut sightings = Vec::new();
        for (face, result) in faces.iter().zip(matches) {
            let outcome = if result.recognized { "recognized" } else { "unknown" };
            telemetry::metrics::RECOGNITION_FACES_MATCHED
                .with_label_values(&["video", outcome])
                .inc();

            let (true, Some(identity_id)) = (result.recognized, result.best_identity_id) else {
                continue;
            };
            sightings.push(Sighting {
                identity_id,
                display_name: result.display_name.unwrap_or_default(),
                group_label: result.group_label.unwrap_or_default(),
                similarity: result.similarity,
                crop: crop_face(&frame.image, &face.bbox),
            });
        }

        let closed = tracker.observe(frame.timestamp, sightings)?;
        telemetry::metrics::RECOGNITION_FRAMES_PROCESSED.inc();
        Ok(closed)
    }

    async fn finalize(
        &self,
        task_id: &str,
        closed: Vec<ClosedAppearance<Crop>>,
        events: &mut Vec<AppearanceEvent>,
    ) {
        for ClosedAppearance { mut event, crop } in closed {
            if let Some(crop) = crop {
                event.sample_crop_reference = self
                    .crops
                    .save(task_id, &event.identity_id, event.start_time, crop)
                    .await;
            }

            telemetry::metrics::RECOGNITION_APPEARANCE_EVENTS.inc();
            info!(
                identity_id = %event.identity_id,
                start_time = event.start_time,
                end_time = ?event.end_time,
                peak_similarity = event.peak_similarity,
                "appearance closed"
            );
            events.push(event);
        }
    }
}

fn skip_reason(err: &RecognitionError) -> &'static str {
    match err {
        RecognitionError::Detector(_) => "detector",
        RecognitionError::InvalidEmbedding(_) => "invalid_embedding",
        RecognitionError::OutOfOrderFrame { .. } => "out_of_order",
        _ => "other",
    }
}

fn crop_face(frame: &RgbImage, bbox: &BoundingBox) -> Crop {
    let bbox = bbox.clamp_to(frame.width(), frame.height())?;
    Some(image::imageops::crop_imm(frame, bbox.x1, bbox.y1, bbox.width(), bbox.height()).to_image())
}

fn spawn_decoder(
    videos: Arc<dyn VideoSource>,
    reference: String,
    interval_secs: f64,
    max_consecutive_failures: u32,
    tx: mpsc::Sender<RecognitionResult<DecodeEvent>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let decoder = match videos.open(&reference, interval_secs) {
            Ok(decoder) => decoder,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        let mut sampler = match FrameSampler::new(decoder, interval_secs, max_consecutive_failures) {
            Ok(sampler) => sampler,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        let opened = DecodeEvent::Opened {
            expected_samples: sampler.expected_samples(),
        };
        if tx.blocking_send(Ok(opened)).is_err() {
            return;
        }

        while let Some(item) = sampler.next() {
            if cancel.is_cancelled() {
                return;
            }
            let message = item.map(|frame| DecodeEvent::Frame {
                frame,
                skipped: sampler.skipped(),
            });
            if tx.blocking_send(message).is_err() {
                return;
            }
        }

        let _ = tx.blocking_send(Ok(DecodeEvent::Finished {
            skipped: sampler.skipped(),
        }));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{FaceDetection, ScriptedDetector};
    use crate::gallery::tests::record;
    use crate::gallery::MemoryGalleryStore;
    use crate::pipeline::sampler::tests::{FakeDecoder, FakeFrame, FakeVideoSource};
    use common::recognition::{AnalysisTask, TaskStatus};
    use common::validation::safe_unix_millis;

    const TASK: &str = "task-1";

    fn params(threshold: f32, interval: f64, exit_delay: f64) -> AnalysisParameters {
        AnalysisParameters {
            threshold,
            base_interval_secs: interval,
            speed_up_factor: 1.0,
            exit_delay_secs: exit_delay,
        }
    }

    async fn store_with_task(parameters: AnalysisParameters) -> TaskStore {
        let store = TaskStore::new();
        store
            .insert(AnalysisTask {
                task_id: TASK.to_string(),
                video_reference: "/videos/hall.mp4".to_string(),
                parameters,
                status: TaskStatus::Queued,
                progress: 0,
                start_time: safe_unix_millis(),
                finished_at: None,
                frames_processed: 0,
                frames_skipped: 0,
                results: Vec::new(),
                identities: Vec::new(),
                stats: None,
                error: None,
            })
            .await;
        store
    }

    fn face(embedding: Vec<f32>) -> FaceDetection {
        FaceDetection::new(BoundingBox::new(0, 0, 2, 2), embedding)
    }

    fn pts_frames(times: &[f64]) -> Vec<FakeFrame> {
        times.iter().map(|&t| FakeFrame::Good { pts: Some(t) }).collect()
    }

    async fn run(
        parameters: AnalysisParameters,
        gallery: MemoryGalleryStore,
        detector: ScriptedDetector,
        decoder: FakeDecoder,
        crops: CropWriter,
    ) -> AnalysisTask {
        let store = store_with_task(parameters).await;
        let worker = AnalysisWorker::new(
            store.clone(),
            Arc::new(IndexCache::new(Arc::new(gallery))),
            DetectorPool::new(Arc::new(detector), 1),
            Arc::new(FakeVideoSource::new(decoder)),
            crops,
            3,
        );
        let job = AnalysisJob {
            task_id: TASK.to_string(),
            video_reference: "/videos/hall.mp4".to_string(),
            parameters,
        };
        worker.run(job, CancellationToken::new()).await;
        store.get(TASK).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_event_flushed_at_end_of_video() {
        let noise = vec![0.1, (1.0f32 - 0.01).sqrt()];
        let detector = ScriptedDetector::new()
            .then_faces(vec![face(vec![1.0, 0.0])])
            .then_faces(vec![face(vec![1.0, 0.0])])
            .then_faces(vec![face(noise)]);
        let crops = tempfile::tempdir().unwrap();

        let task = run(
            params(0.5, 2.0, 3.0),
            MemoryGalleryStore::with_records(vec![record("1", vec![1.0, 0.0])]),
            detector,
            FakeDecoder::from_frames(None, pts_frames(&[0.0, 1.0, 2.0, 3.0, 4.0])),
            CropWriter::new(crops.path()),
        )
        .await;

        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.progress, 100);
        assert_eq!(task.frames_processed, 3);
        assert_eq!(task.results.len(), 1);

        let entry = &task.results[0];
        assert_eq!(entry.identity_id, "1");
        assert_eq!(entry.start_time, 0.0);
        assert_eq!(entry.end_time, 2.0);
        assert_eq!(entry.duration, 2.0);
        assert_eq!(entry.peak_similarity, 1.0);

        let crop = entry.sample_crop_reference.as_deref().unwrap();
        assert!(std::path::Path::new(crop).exists());

        let stats = task.stats.unwrap();
        assert_eq!(stats.distinct_identities, 1);
        assert_eq!(stats.total_events, 1);
    }

    #[tokio::test]
    async fn test_detector_failures_skip_frames() {
        let detector = ScriptedDetector::new()
            .then_fail("model crashed")
            .then_faces(vec![face(vec![0.0, 1.0])]);

        let task = run(
            params(0.5, 1.0, 5.0),
            MemoryGalleryStore::with_records(vec![record("bob", vec![0.0, 1.0])]),
            detector,
            FakeDecoder::from_frames(None, pts_frames(&[0.0, 1.0])),
            CropWriter::disabled(),
        )
        .await;

        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.frames_processed, 1);
        assert_eq!(task.frames_skipped, 1);
        assert_eq!(task.results.len(), 1);
        assert_eq!(task.results[0].start_time, 1.0);
        assert!(task.results[0].sample_crop_reference.is_none());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_task() {
        let task = run(
            params(0.5, 1.0, 5.0),
            MemoryGalleryStore::with_records(vec![record("bob", vec![0.0, 1.0])]),
            ScriptedDetector::repeating(vec![face(vec![1.0, 0.0, 0.0])]),
            FakeDecoder::from_frames(None, pts_frames(&[0.0, 1.0])),
            CropWriter::disabled(),
        )
        .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("dimension mismatch"));
        assert!(task.results.is_empty());
        assert!(task.progress < 100);
    }

    #[tokio::test]
    async fn test_failed_task_leaves_no_crops() {
        // The first visit closes at t=10 and writes its crop, then t=11 fails the task
        let detector = ScriptedDetector::new()
            .then_faces(vec![face(vec![0.0, 1.0])])
            .then_faces(Vec::new())
            .then_faces(vec![face(vec![1.0, 0.0, 0.0])]);
        let crops = tempfile::tempdir().unwrap();

        let task = run(
            params(0.5, 1.0, 3.0),
            MemoryGalleryStore::with_records(vec![record("bob", vec![0.0, 1.0])]),
            detector,
            FakeDecoder::from_frames(None, pts_frames(&[0.0, 10.0, 11.0])),
            CropWriter::new(crops.path()),
        )
        .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.results.is_empty());
        assert!(!crops.path().join(TASK).exists());
    }

    #[tokio::test]
    async fn test_empty_gallery_completes_without_detection() {
        let detector = ScriptedDetector::repeating(vec![face(vec![1.0, 0.0])]);
        let store = store_with_task(params(0.5, 1.0, 5.0)).await;
        let detector = Arc::new(detector);
        let worker = AnalysisWorker::new(
            store.clone(),
            Arc::new(IndexCache::new(Arc::new(MemoryGalleryStore::new()))),
            DetectorPool::new(detector.clone(), 1),
            Arc::new(FakeVideoSource::new(FakeDecoder::with_fps(1.0, 5))),
            CropWriter::disabled(),
            3,
        );
        let job = AnalysisJob {
            task_id: TASK.to_string(),
            video_reference: "/videos/hall.mp4".to_string(),
            parameters: params(0.5, 1.0, 5.0),
        };
        worker.run(job, CancellationToken::new()).await;

        let task = store.get(TASK).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.results.is_empty());
        assert_eq!(task.stats.unwrap().total_events, 0);
        assert_eq!(detector.calls(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_video_fails_task() {
        let frames = vec![
            FakeFrame::Good { pts: Some(0.0) },
            FakeFrame::GrabError,
            FakeFrame::DecodeError,
            FakeFrame::GrabError,
            FakeFrame::Good { pts: Some(4.0) },
        ];

        let task = run(
            params(0.5, 1.0, 5.0),
            MemoryGalleryStore::with_records(vec![record("bob", vec![0.0, 1.0])]),
            ScriptedDetector::new(),
            FakeDecoder::from_frames(None, frames),
            CropWriter::disabled(),
        )
        .await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("consecutive"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = store_with_task(params(0.5, 1.0, 5.0)).await;
        let worker = AnalysisWorker::new(
            store.clone(),
            Arc::new(IndexCache::new(Arc::new(MemoryGalleryStore::new()))),
            DetectorPool::new(Arc::new(ScriptedDetector::new()), 1),
            Arc::new(FakeVideoSource::new(FakeDecoder::with_fps(1.0, 5))),
            CropWriter::disabled(),
            3,
        );
        let token = CancellationToken::new();
        token.cancel();

        let job = AnalysisJob {
            task_id: TASK.to_string(),
            video_reference: "/videos/hall.mp4".to_string(),
            parameters: params(0.5, 1.0, 5.0),
        };
        worker.run(job, token).await;

        let task = store.get(TASK).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Cancelled"));
    }
}
