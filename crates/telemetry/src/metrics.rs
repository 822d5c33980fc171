// Metric construction only fails on malformed names, which are static here.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Analysis Task Metrics ====
    pub static ref RECOGNITION_ACTIVE_ANALYSES: IntGauge = {
        let metric = IntGauge::new(
            "recognition_active_analyses",
            "Number of analysis tasks currently queued or running",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_ANALYSIS_OUTCOMES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_analysis_outcomes_total",
                "Total number of analysis tasks by terminal status",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_ANALYSIS_DURATION: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "recognition_analysis_duration_seconds",
                "Wall-clock time from task start to terminal status",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Frame Pipeline Metrics ====
    pub static ref RECOGNITION_FRAMES_PROCESSED: IntCounter = {
        let metric = IntCounter::new(
            "recognition_frames_processed_total",
            "Total number of sampled frames that went through detection and matching",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_FRAMES_SKIPPED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_frames_skipped_total",
                "Total number of sampled frames that were skipped",
            ),
            &["reason"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_FACES_MATCHED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_faces_matched_total",
                "Total number of detected faces by match outcome",
            ),
            &["source", "outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_DETECTION_LATENCY: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "recognition_detection_latency_seconds",
                "Time spent detecting faces and extracting embeddings for one frame",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["detector"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_APPEARANCE_EVENTS: IntCounter = {
        let metric = IntCounter::new(
            "recognition_appearance_events_total",
            "Total number of closed appearance events",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Gallery Metrics ====
    pub static ref RECOGNITION_GALLERY_SIZE: IntGauge = {
        let metric = IntGauge::new(
            "recognition_gallery_size",
            "Number of enrolled identities in the gallery",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_INDEX_REBUILDS: IntCounter = {
        let metric = IntCounter::new(
            "recognition_index_rebuilds_total",
            "Total number of gallery index rebuilds",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Live Matching Metrics ====
    pub static ref RECOGNITION_LIVE_REQUESTS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "recognition_live_requests_total",
                "Total number of single-frame match requests",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_metrics_accessible() {
        RECOGNITION_ANALYSIS_OUTCOMES
            .with_label_values(&["completed"])
            .inc();
        assert!(
            RECOGNITION_ANALYSIS_OUTCOMES
                .with_label_values(&["completed"])
                .get()
                >= 1
        );
    }

    #[test]
    fn test_gallery_gauge_accessible() {
        RECOGNITION_GALLERY_SIZE.set(7);
        assert_eq!(RECOGNITION_GALLERY_SIZE.get(), 7);
    }

    #[test]
    fn test_encode_metrics_lists_registered_families() {
        RECOGNITION_FRAMES_PROCESSED.inc();
        let encoded = encode_metrics().expect("metrics should encode");
        assert!(encoded.contains("recognition_frames_processed_total"));
    }
}
