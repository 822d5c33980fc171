//! Video analysis pipeline: sampling, matching, tracking and reporting

pub mod aggregator;
pub mod matcher;
pub mod sampler;
pub mod tracker;
pub mod worker;

pub use sampler::{FfmpegVideoSource, VideoDecoder, VideoSource};
pub use worker::{AnalysisJob, AnalysisWorker};
