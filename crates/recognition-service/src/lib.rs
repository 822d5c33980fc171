pub mod api;
pub mod config;
pub mod crops;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod gallery;
pub mod pipeline;
pub mod state;
pub mod tasks;

pub use config::ServiceConfig;
pub use error::{ApiError, RecognitionError, RecognitionResult};
pub use state::AppState;
