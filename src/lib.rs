//! Workspace facade so the end-to-end tests under `tests/` can reach every
//! member crate through one dependency.

pub use common;
pub use recognition_service;
