pub mod frame_extractor;
pub mod recognition;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
