//! Face recognition contracts shared by the recognition service and its clients.
//!
//! This module defines the gallery record shape, per-frame match results, the
//! video analysis task lifecycle and the appearance report delivered on
//! completion.

use serde::{Deserialize, Serialize};

/// Bounding box in pixel coordinates (top-left and bottom-right corners)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Clip the box to an image of the given size.
    ///
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<Self> {
        let clamped = Self {
            x1: self.x1.min(image_width),
            y1: self.y1.min(image_height),
            x2: self.x2.min(image_width),
            y2: self.y2.min(image_height),
        };
        if clamped.area() == 0 {
            None
        } else {
            Some(clamped)
        }
    }
}

/// An enrolled identity as supplied by the gallery store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    /// Unique identity ID
    pub identity_id: String,

    /// Person's name
    pub display_name: String,

    /// Issuing station or location the record belongs to
    pub group_label: String,

    /// Raw face embedding (not necessarily unit length)
    pub embedding: Vec<f32>,

    /// Reference image of the enrolled face
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_image_path: Option<String>,

    /// Enrollment timestamp (Unix timestamp in seconds)
    #[serde(default)]
    pub enrolled_at: u64,
}

/// Gallery record as listed over the API (embedding omitted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub display_name: String,
    pub group_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_image_path: Option<String>,
    pub enrolled_at: u64,
    /// Embedding dimensionality
    pub dimension: usize,
}

impl From<&GalleryRecord> for GalleryEntry {
    fn from(record: &GalleryRecord) -> Self {
        Self {
            identity_id: record.identity_id.clone(),
            display_name: record.display_name.clone(),
            group_label: record.group_label.clone(),
            reference_image_path: record.reference_image_path.clone(),
            enrolled_at: record.enrolled_at,
            dimension: record.embedding.len(),
        }
    }
}

/// Request to enroll an identity, either from a raw embedding or from an image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Identity ID (generated when omitted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,

    pub display_name: String,

    pub group_label: String,

    /// Precomputed embedding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Base64 encoded face image (data URL prefix allowed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
}

/// Response to an enrollment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub success: bool,
    pub identity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Enrolled identities, in enrollment order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryListResponse {
    pub identities: Vec<GalleryEntry>,
}

/// Classification of one detected face against the gallery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub bbox: BoundingBox,

    /// Timestamp of the frame the face was found in (seconds of video time)
    pub frame_timestamp: f64,

    /// Closest gallery identity, `None` when the gallery is empty
    pub best_identity_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,

    /// Enrollment image of the matched identity, only set when recognized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image_path: Option<String>,

    /// Cosine similarity to the closest identity (-1.0 to 1.0)
    pub similarity: f32,

    /// `similarity >= threshold` and a closest identity exists
    pub recognized: bool,
}

/// Request to match a single live camera frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMatchRequest {
    /// Base64 encoded image (data URL prefix allowed)
    pub image: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

/// Result of matching a single live frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMatchResponse {
    pub detections: Vec<MatchResult>,
    pub gallery_size: usize,
}

/// Tunables of one video analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParameters {
    /// Minimum cosine similarity for a recognized match, in (0, 1]
    pub threshold: f32,

    /// Base sampling period in seconds of video time
    pub base_interval_secs: f64,

    /// Divides the base sampling period
    pub speed_up_factor: f64,

    /// Longest tolerated gap between sightings of one identity
    pub exit_delay_secs: f64,
}

impl AnalysisParameters {
    /// Seconds of video time between two sampled frames
    pub fn sampling_interval_secs(&self) -> f64 {
        self.base_interval_secs / self.speed_up_factor
    }
}

/// Request to analyze a video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Video file path or URI readable by the decoder
    pub video_reference: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_interval_secs: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_up_factor: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_delay_secs: Option<f64>,
}

/// Response to an analysis submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Analysis task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, worker not started yet
    Queued,

    /// Worker is sampling frames
    Running,

    /// Report available
    Completed,

    /// Aborted with an error (including cancellation)
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A continuous interval during which one identity was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppearanceEvent {
    pub identity_id: String,
    pub display_name: String,
    pub group_label: String,
    pub start_time: f64,
    pub last_seen_time: f64,
    /// Set once the event is closed
    pub end_time: Option<f64>,
    pub peak_similarity: f32,
    /// Number of matches folded into this event
    pub sightings: u32,
    pub sample_crop_reference: Option<String>,
}

/// One row of the final report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppearanceEntry {
    pub identity_id: String,
    pub display_name: String,
    pub group_label: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub peak_similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_crop_reference: Option<String>,
}

/// Per-identity rollup of the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityVisits {
    pub identity_id: String,
    pub display_name: String,
    pub group_label: String,
    pub visits: u32,
    pub total_duration: f64,
    pub peak_similarity: f32,
}

/// Summary statistics of a completed analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStats {
    pub distinct_identities: usize,
    pub total_events: usize,
    /// Wall-clock processing time in seconds
    pub processing_time: f64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
}

/// Final report of a video analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub appearances: Vec<AppearanceEntry>,
    pub identities: Vec<IdentityVisits>,
    pub stats: ReportStats,
}

/// Snapshot of a video analysis task as returned to pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub task_id: String,

    pub video_reference: String,

    pub parameters: AnalysisParameters,

    pub status: TaskStatus,

    /// Percent complete, 100 only once completed
    pub progress: u8,

    /// Submission timestamp (Unix timestamp in milliseconds)
    pub start_time: u64,

    /// Timestamp of the terminal transition (Unix timestamp in milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,

    pub frames_processed: u64,

    pub frames_skipped: u64,

    /// Appearance report rows, filled on completion
    #[serde(default)]
    pub results: Vec<AppearanceEntry>,

    #[serde(default)]
    pub identities: Vec<IdentityVisits>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReportStats>,

    /// Failure reason when status is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// List of analysis tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisListResponse {
    pub tasks: Vec<AnalysisTask>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_clamp() {
        let bbox = BoundingBox::new(600, 400, 700, 520);
        let clamped = bbox.clamp_to(640, 480).unwrap();
        assert_eq!(clamped, BoundingBox::new(600, 400, 640, 480));
        assert_eq!(clamped.width(), 40);
        assert_eq!(clamped.height(), 80);

        let outside = BoundingBox::new(700, 10, 800, 50);
        assert!(outside.clamp_to(640, 480).is_none());
    }

    #[test]
    fn test_inverted_box_has_no_area() {
        let bbox = BoundingBox::new(50, 50, 10, 10);
        assert_eq!(bbox.width(), 0);
        assert_eq!(bbox.area(), 0);
    }

    #[test]
    fn test_sampling_interval() {
        let params = AnalysisParameters {
            threshold: 0.3,
            base_interval_secs: 3.0,
            speed_up_factor: 1.5,
            exit_delay_secs: 10.0,
        };
        assert!((params.sampling_interval_secs() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");

        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn test_analysis_request_defaults_omitted() {
        let request: AnalysisRequest =
            serde_json::from_str(r#"{"video_reference": "/videos/lobby.mp4"}"#).unwrap();
        assert_eq!(request.video_reference, "/videos/lobby.mp4");
        assert!(request.threshold.is_none());
        assert!(request.exit_delay_secs.is_none());
    }
}
