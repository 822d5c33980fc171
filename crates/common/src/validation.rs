//! Input validation for analysis submissions, enrollments and identifiers
//!
//! External inputs are checked here before they reach the recognition core:
//! - Analysis tunables (threshold, sampling interval, speed-up, exit delay)
//! - Embedding vectors (non-empty, finite)
//! - Identifiers, names and video references (length, traversal, shell metacharacters)

use crate::recognition::AnalysisParameters;
use anyhow::{anyhow, Result};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for identity and task IDs
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for video references (paths, RTSP/HTTP URIs)
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for display names and group labels
pub const MAX_NAME_LENGTH: usize = 512;

/// Largest accepted embedding dimensionality
pub const MAX_EMBEDDING_DIMENSION: usize = 4096;

// ============================================================================
// Safe Time Operations
// ============================================================================

/// Get current Unix timestamp in seconds, safely handling clock errors
pub fn safe_unix_timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs(),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "System clock is before UNIX epoch (1970-01-01), using timestamp 0"
            );
            0
        }
    }
}

/// Get current Unix timestamp in milliseconds, 0 on clock errors
pub fn safe_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate resource ID (identity_id, task_id)
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    // IDs end up in crop file names
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    Ok(())
}

/// Validate display name or group label
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_NAME_LENGTH, field_name)?;
    Ok(())
}

/// Validate a video reference (file path, RTSP, HTTP)
pub fn validate_video_reference(reference: &str) -> Result<()> {
    validate_non_empty(reference, "video_reference")?;
    validate_length(reference, MAX_URI_LENGTH, "video_reference")?;

    // Passed to ffmpeg/ffprobe as an argument
    if reference.trim_start().starts_with('-') {
        return Err(anyhow!(
            "video_reference cannot start with '-' (would be read as an ffmpeg option)"
        ));
    }

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if reference.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "video_reference contains dangerous shell metacharacters"
        ));
    }

    Ok(())
}

// ============================================================================
// Recognition Validation
// ============================================================================

/// Validate similarity threshold, in (0, 1]
pub fn validate_threshold(threshold: f32) -> Result<()> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
        return Err(anyhow!(
            "threshold must be in (0, 1], got {}",
            threshold
        ));
    }
    Ok(())
}

/// Validate all analysis tunables
pub fn validate_analysis_parameters(params: &AnalysisParameters) -> Result<()> {
    validate_threshold(params.threshold)?;

    if !params.base_interval_secs.is_finite() || params.base_interval_secs <= 0.0 {
        return Err(anyhow!(
            "base_interval_secs must be greater than 0, got {}",
            params.base_interval_secs
        ));
    }

    if !params.speed_up_factor.is_finite() || params.speed_up_factor <= 0.0 {
        return Err(anyhow!(
            "speed_up_factor must be greater than 0, got {}",
            params.speed_up_factor
        ));
    }

    if !params.exit_delay_secs.is_finite() || params.exit_delay_secs < 0.0 {
        return Err(anyhow!(
            "exit_delay_secs must be 0 or greater, got {}",
            params.exit_delay_secs
        ));
    }

    Ok(())
}

/// Validate an embedding vector before it is stored
pub fn validate_embedding(embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(anyhow!("embedding cannot be empty"));
    }

    if embedding.len() > MAX_EMBEDDING_DIMENSION {
        return Err(anyhow!(
            "embedding dimension {} exceeds maximum of {}",
            embedding.len(),
            MAX_EMBEDDING_DIMENSION
        ));
    }

    if let Some(position) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(anyhow!(
            "embedding contains a non-finite value at index {}",
            position
        ));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnalysisParameters {
        AnalysisParameters {
            threshold: 0.5,
            base_interval_secs: 3.0,
            speed_up_factor: 1.5,
            exit_delay_secs: 10.0,
        }
    }

    #[test]
    fn test_safe_unix_timestamp() {
        let ts = safe_unix_timestamp();
        assert!(ts > 1700000000); // After 2023
        assert!(safe_unix_millis() / 1000 >= ts);
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("suspect-123", "identity_id").is_ok());
        assert!(validate_id("valid_id_with-dashes_123", "id").is_ok());

        assert!(validate_id("", "id").is_err());
        assert!(validate_id("  ", "id").is_err());
        assert!(validate_id("../etc/passwd", "id").is_err());
        assert!(validate_id("path/to/something", "id").is_err());
        assert!(validate_id(&"a".repeat(300), "id").is_err());
    }

    #[test]
    fn test_validate_video_reference() {
        assert!(validate_video_reference("/data/videos/lobby.mp4").is_ok());
        assert!(validate_video_reference("rtsp://camera.local/stream").is_ok());

        assert!(validate_video_reference("").is_err());
        assert!(validate_video_reference("clip.mp4;rm -rf /").is_err());
        assert!(validate_video_reference("rtsp://cam$(id).local").is_err());
        assert!(validate_video_reference(&"a".repeat(5000)).is_err());
        assert!(validate_video_reference("-version").is_err());
        assert!(validate_video_reference(" -i /etc/passwd").is_err());
        assert!(validate_video_reference("clips/-first-take.mp4").is_ok());
    }

    #[test]
    fn test_validate_threshold_bounds() {
        assert!(validate_threshold(1.0).is_ok());
        assert!(validate_threshold(0.3).is_ok());
        assert!(validate_threshold(f32::MIN_POSITIVE).is_ok());

        assert!(validate_threshold(0.0).is_err());
        assert!(validate_threshold(-0.2).is_err());
        assert!(validate_threshold(1.0001).is_err());
        assert!(validate_threshold(f32::NAN).is_err());
    }

    #[test]
    fn test_validate_analysis_parameters() {
        assert!(validate_analysis_parameters(&params()).is_ok());

        let zero_delay = AnalysisParameters {
            exit_delay_secs: 0.0,
            ..params()
        };
        assert!(validate_analysis_parameters(&zero_delay).is_ok());

        let bad_interval = AnalysisParameters {
            base_interval_secs: 0.0,
            ..params()
        };
        assert!(validate_analysis_parameters(&bad_interval).is_err());

        let bad_speed = AnalysisParameters {
            speed_up_factor: -1.0,
            ..params()
        };
        assert!(validate_analysis_parameters(&bad_speed).is_err());

        let bad_delay = AnalysisParameters {
            exit_delay_secs: f64::INFINITY,
            ..params()
        };
        assert!(validate_analysis_parameters(&bad_delay).is_err());
    }

    #[test]
    fn test_validate_embedding() {
        assert!(validate_embedding(&[0.1, 0.2, 0.3]).is_ok());
        assert!(validate_embedding(&[]).is_err());
        assert!(validate_embedding(&[0.1, f32::NAN]).is_err());
        assert!(validate_embedding(&vec![0.0; MAX_EMBEDDING_DIMENSION + 1]).is_err());
    }
}
