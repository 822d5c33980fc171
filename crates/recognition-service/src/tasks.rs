//! Analysis task registry and lifecycle
//!
//! `TaskStore` is the shared record of every submitted analysis. Only the
//! transitions `queued -> running -> completed | failed` and
//! `queued -> failed` are possible; terminal tasks are never touched again.
//! Finished tasks beyond the retention limit are dropped oldest first.
//! `TaskCoordinator` validates submissions, spawns the worker for each task
//! and owns the cancellation tokens.

use crate::error::{RecognitionError, RecognitionResult};
use crate::pipeline::worker::{AnalysisJob, AnalysisWorker};
use common::recognition::{
    AnalysisParameters, AnalysisReport, AnalysisRequest, AnalysisTask, TaskStatus,
};
use common::validation::{safe_unix_millis, validate_analysis_parameters, validate_video_reference};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Progress while running never reaches 100
const MAX_RUNNING_PROGRESS: u64 = 99;

const DEFAULT_RETENTION_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<String, AnalysisTask>>>,
    retention_limit: usize,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION_LIMIT)
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` finished tasks; queued and running tasks are never dropped
    pub fn with_retention(limit: usize) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            retention_limit: limit.max(1),
        }
    }

    pub async fn insert(&self, task: AnalysisTask) {
        self.tasks.write().await.insert(task.task_id.clone(), task);
    }

    pub async fn get(&self, task_id: &str) -> Option<AnalysisTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// All tasks, oldest submission first
    pub async fn list(&self) -> Vec<AnalysisTask> {
        let mut tasks: Vec<AnalysisTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    /// Move a queued task to running. Returns false for any other state.
    pub async fn mark_running(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Publish frame counters of a running task
    ///
    /// Progress only moves forward and stays below 100. Without an expected
    /// sample count it stays at 0.
    pub async fn record_progress(
        &self,
        task_id: &str,
        processed: u64,
        frame_skipped: u64,
        decode_skipped: u64,
        expected_samples: Option<u64>,
    ) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            return;
        }

        task.frames_processed = processed;
        task.frames_skipped = frame_skipped + decode_skipped;

        let progress = match expected_samples {
            Some(expected) if expected > 0 => {
                let done = processed + frame_skipped;
                (done.saturating_mul(100) / expected).min(MAX_RUNNING_PROGRESS) as u8
            }
            _ => 0,
        };
        task.progress = task.progress.max(progress);
    }

    /// Attach the report and finish the task. Returns false if it was
    /// already terminal or is unknown.
    pub async fn complete(&self, task_id: &str, report: AnalysisReport) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.finished_at = Some(safe_unix_millis());
        task.frames_processed = report.stats.frames_processed;
        task.frames_skipped = report.stats.frames_skipped;
        task.results = report.appearances;
        task.identities = report.identities;
        task.stats = Some(report.stats);
        evict_finished(&mut tasks, self.retention_limit, task_id);
        true
    }

    /// Fail the task with `error`. Returns false if it was already terminal
    /// or is unknown.
    pub async fn fail(&self, task_id: &str, error: impl Into<String>) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        task.status = TaskStatus::Failed;
        task.finished_at = Some(safe_unix_millis());
        task.error = Some(error.into());
        evict_finished(&mut tasks, self.retention_limit, task_id);
        true
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}

/// Drop the oldest finished tasks beyond `limit`, never `just_finished`
fn evict_finished(tasks: &mut HashMap<String, AnalysisTask>, limit: usize, just_finished: &str) {
    let mut finished: Vec<(u64, String)> = tasks
        .values()
        .filter(|t| t.status.is_terminal() && t.task_id != just_finished)
        .map(|t| (t.finished_at.unwrap_or(t.start_time), t.task_id.clone()))
        .collect();

    let excess = (finished.len() + 1).saturating_sub(limit);
    if excess == 0 {
        return;
    }

    finished.sort();
    for (_, task_id) in finished.into_iter().take(excess) {
        tasks.remove(&task_id);
        debug!(task_id = %task_id, "evicted finished analysis");
    }
}

/// Accepts analysis requests and runs each on its own worker
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: TaskStore,
    worker: AnalysisWorker,
    defaults: AnalysisParameters,
    tokens: RwLock<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl TaskCoordinator {
    /// `worker` must publish into `store`
    pub fn new(store: TaskStore, worker: AnalysisWorker, defaults: AnalysisParameters) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                worker,
                defaults,
                tokens: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn defaults(&self) -> AnalysisParameters {
        self.inner.defaults
    }

    /// Validate and queue an analysis, returning the queued task
    ///
    /// The worker is spawned in the background; the caller never waits for it.
    pub async fn submit(&self, request: AnalysisRequest) -> RecognitionResult<AnalysisTask> {
        let defaults = self.inner.defaults;
        let parameters = AnalysisParameters {
            threshold: request.threshold.unwrap_or(defaults.threshold),
            base_interval_secs: request
                .base_interval_secs
                .unwrap_or(defaults.base_interval_secs),
            speed_up_factor: request.speed_up_factor.unwrap_or(defaults.speed_up_factor),
            exit_delay_secs: request.exit_delay_secs.unwrap_or(defaults.exit_delay_secs),
        };

        validate_video_reference(&request.video_reference)
            .map_err(|e| RecognitionError::invalid_parameter(e.to_string()))?;
        validate_analysis_parameters(&parameters)
            .map_err(|e| RecognitionError::invalid_parameter(e.to_string()))?;

        if self.inner.shutdown.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }

        let task = AnalysisTask {
            task_id: Uuid::new_v4().to_string(),
            video_reference: request.video_reference,
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
        };

        self.inner.store.insert(task.clone()).await;

        let token = self.inner.shutdown.child_token();
        self.inner
            .tokens
            .write()
            .await
            .insert(task.task_id.clone(), token.clone());
        telemetry::metrics::RECOGNITION_ACTIVE_ANALYSES.inc();

        info!(
            task_id = %task.task_id,
            video = %task.video_reference,
            "analysis queued"
        );

        let job = AnalysisJob {
            task_id: task.task_id.clone(),
            video_reference: task.video_reference.clone(),
            parameters,
        };
        let coordinator = self.clone();
        tokio::spawn(async move {
            let task_id = job.task_id.clone();
            coordinator.inner.worker.run(job, token).await;
            coordinator.inner.tokens.write().await.remove(&task_id);
            telemetry::metrics::RECOGNITION_ACTIVE_ANALYSES.dec();
        });

        Ok(task)
    }

    pub async fn poll(&self, task_id: &str) -> RecognitionResult<AnalysisTask> {
        self.inner
            .store
            .get(task_id)
            .await
            .ok_or_else(|| RecognitionError::UnknownTask(task_id.to_string()))
    }

    /// Cancel a task
    ///
    /// A task that is not yet terminal fails with "Cancelled" right away and
    /// its worker is told to stop. Terminal tasks are returned unchanged.
    pub async fn cancel(&self, task_id: &str) -> RecognitionResult<AnalysisTask> {
        if self
            .inner
            .store
            .fail(task_id, RecognitionError::Cancelled.to_string())
            .await
        {
            telemetry::metrics::RECOGNITION_ANALYSIS_OUTCOMES
                .with_label_values(&["failed"])
                .inc();
            info!(task_id, "analysis cancelled");
        }

        if let Some(token) = self.inner.tokens.read().await.get(task_id) {
            token.cancel();
        }

        self.poll(task_id).await
    }

    pub async fn list(&self) -> Vec<AnalysisTask> {
        self.inner.store.list().await
    }

    /// Refuse new submissions and cancel everything in flight
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let active: Vec<String> = self.inner.tokens.read().await.keys().cloned().collect();
        for task_id in &active {
            if let Err(e) = self.cancel(task_id).await {
                debug!(task_id, error = %e, "task vanished during shutdown");
            }
        }
        info!(cancelled = active.len(), "task coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crops::CropWriter;
    use crate::detector::scripted::ScriptedDetector;
    use crate::detector::{DetectorPool, FaceDetection};
    use crate::gallery::tests::record;
    use crate::gallery::{IndexCache, MemoryGalleryStore};
    use crate::pipeline::sampler::tests::{FakeDecoder, FakeFrame, FakeVideoSource};
    use common::recognition::BoundingBox;
    use std::time::Duration;

    fn videos(fps: Option<f64>, frames: Vec<FakeFrame>) -> FakeVideoSource {
        let mut decoder = FakeDecoder::from_frames(fps, frames);
        if fps.is_some() {
            decoder.frame_count = Some(decoder.frames.len() as u64);
        }
        FakeVideoSource::new(decoder)
    }

    fn defaults() -> AnalysisParameters {
        AnalysisParameters {
            threshold: 0.5,
            base_interval_secs: 1.0,
            speed_up_factor: 1.0,
            exit_delay_secs: 1.5,
        }
    }

    fn good(n: usize) -> Vec<FakeFrame> {
        (0..n).map(|_| FakeFrame::Good { pts: None }).collect()
    }

    fn coordinator(detector: ScriptedDetector, videos: FakeVideoSource) -> TaskCoordinator {
        let store = TaskStore::new();
        let gallery = MemoryGalleryStore::with_records(vec![
            record("alice", vec![1.0, 0.0]),
            record("bob", vec![0.0, 1.0]),
        ]);
        let worker = AnalysisWorker::new(
            store.clone(),
            Arc::new(IndexCache::new(Arc::new(gallery))),
            DetectorPool::new(Arc::new(detector), 1),
            Arc::new(videos),
            CropWriter::disabled(),
            3,
        );
        TaskCoordinator::new(store, worker, defaults())
    }

    fn request(video: &str) -> AnalysisRequest {
        AnalysisRequest {
            video_reference: video.to_string(),
            threshold: None,
            base_interval_secs: None,
            speed_up_factor: None,
            exit_delay_secs: None,
        }
    }

    async fn wait_terminal(coordinator: &TaskCoordinator, task_id: &str) -> AnalysisTask {
        for _ in 0..500 {
            let task = coordinator.poll(task_id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    fn queued(task_id: &str) -> AnalysisTask {
        AnalysisTask {
            task_id: task_id.to_string(),
            video_reference: "/videos/a.mp4".to_string(),
            parameters: defaults(),
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
        }
    }

    fn alice() -> FaceDetection {
        FaceDetection::new(BoundingBox::new(0, 0, 2, 2), vec![1.0, 0.0])
    }

    #[tokio::test]
    async fn test_store_transitions_are_one_way() {
        let store = TaskStore::new();
        store.insert(queued("fixed")).await;

        assert!(store.mark_running("fixed").await);
        assert!(!store.mark_running("fixed").await);
        assert!(store.fail("fixed", "boom").await);
        assert!(!store.complete("fixed", AnalysisReport::default()).await);
        assert!(!store.fail("fixed", "again").await);

        let task = store.get("fixed").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finished_tasks_beyond_retention_are_evicted() {
        let store = TaskStore::with_retention(2);
        for id in ["a", "b", "c", "d"] {
            store.insert(queued(id)).await;
        }
        for id in ["a", "b", "c"] {
            store.mark_running(id).await;
            assert!(store.complete(id, AnalysisReport::default()).await);
        }

        assert!(store.get("a").await.is_none());
        assert!(store.get("b").await.is_some());
        assert!(store.get("c").await.is_some());
        assert_eq!(store.get("d").await.unwrap().status, TaskStatus::Queued);
        assert_eq!(store.len().await, 3);

        // Failing straight from the queue counts as finishing too
        assert!(store.fail("d", "boom").await);
        assert!(store.get("b").await.is_none());
        assert_eq!(store.get("d").await.unwrap().status, TaskStatus::Failed);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotone_and_capped() {
        let store = TaskStore::new();
        store.insert(queued("p")).await;
        store.record_progress("p", 3, 0, 0, Some(4)).await;
        assert_eq!(store.get("p").await.unwrap().progress, 0);
        store.mark_running("p").await;

        store.record_progress("p", 1, 0, 0, Some(4)).await;
        assert_eq!(store.get("p").await.unwrap().progress, 25);

        store.record_progress("p", 4, 0, 2, Some(4)).await;
        let task = store.get("p").await.unwrap();
        assert_eq!(task.progress, 99);
        assert_eq!(task.frames_skipped, 2);

        store.record_progress("p", 2, 0, 0, None).await;
        assert_eq!(store.get("p").await.unwrap().progress, 99);

        assert!(store.complete("p", AnalysisReport::default()).await);
        assert_eq!(store.get("p").await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let detector = ScriptedDetector::new()
            .then_faces(vec![alice()])
            .then_faces(vec![alice()])
            .then_faces(vec![]);
        let coordinator = coordinator(detector, videos(Some(1.0), good(6)));

        let queued = coordinator.submit(request("/videos/lobby.mp4")).await.unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
        assert_eq!(queued.parameters, defaults());

        let task = wait_terminal(&coordinator, &queued.task_id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.progress, 100);
        assert_eq!(task.frames_processed, 6);
        assert_eq!(task.results.len(), 1);
        assert_eq!(task.results[0].identity_id, "alice");
        assert_eq!(task.results[0].start_time, 0.0);
        assert_eq!(task.results[0].end_time, 1.0);
        assert_eq!(task.identities.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let coordinator = coordinator(ScriptedDetector::new(), videos(None, good(1)));

        let mut bad = request("/videos/a.mp4");
        bad.threshold = Some(0.0);
        assert!(matches!(
            coordinator.submit(bad).await,
            Err(RecognitionError::InvalidParameter(_))
        ));

        let mut bad = request("/videos/a.mp4");
        bad.speed_up_factor = Some(-1.0);
        assert!(matches!(
            coordinator.submit(bad).await,
            Err(RecognitionError::InvalidParameter(_))
        ));

        assert!(matches!(
            coordinator.submit(request("")).await,
            Err(RecognitionError::InvalidParameter(_))
        ));
        assert!(coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let coordinator = coordinator(ScriptedDetector::new(), videos(None, good(1)));
        assert!(matches!(
            coordinator.poll("nope").await,
            Err(RecognitionError::UnknownTask(_))
        ));
        assert!(matches!(
            coordinator.cancel("nope").await,
            Err(RecognitionError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_unopenable_video_fails_task() {
        let coordinator = coordinator(ScriptedDetector::new(), videos(None, good(1)));
        let first = coordinator.submit(request("/videos/a.mp4")).await.unwrap();
        wait_terminal(&coordinator, &first.task_id).await;

        let second = coordinator.submit(request("/videos/b.mp4")).await.unwrap();
        let task = wait_terminal(&coordinator, &second.task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("/videos/b.mp4"));
    }

    #[tokio::test]
    async fn test_cancel_marks_failed_and_is_idempotent() {
        let detector = ScriptedDetector::repeating(vec![alice()]);
        let coordinator = coordinator(detector, videos(Some(1.0), good(100_000)));

        let queued = coordinator.submit(request("/videos/long.mp4")).await.unwrap();
        let cancelled = coordinator.cancel(&queued.task_id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("Cancelled"));

        let again = coordinator.cancel(&queued.task_id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Failed);
        assert_eq!(again.finished_at, cancelled.finished_at);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = coordinator.poll(&queued.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.results.is_empty());
    }

    #[tokio::test]
    async fn test_list_orders_by_submission() {
        let coordinator = coordinator(ScriptedDetector::new(), videos(None, good(1)));
        let first = coordinator.submit(request("/videos/a.mp4")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = coordinator.submit(request("/videos/b.mp4")).await.unwrap();

        let ids: Vec<String> = coordinator
            .list()
            .await
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec![first.task_id, second.task_id]);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let coordinator = coordinator(ScriptedDetector::new(), videos(None, good(1)));
        coordinator.shutdown().await;
        assert!(matches!(
            coordinator.submit(request("/videos/a.mp4")).await,
            Err(RecognitionError::Cancelled)
        ));
    }
}
