use crate::detector::FaceDetection;
use crate::error::RecognitionResult;
use crate::gallery::GalleryIndex;
use common::recognition::MatchResult;

/// Classify every face of one frame against the gallery
///
/// Returns one result per face in input order. A face is recognized when its
/// best similarity reaches `threshold` (inclusive).
pub fn match_frame(
    faces: &[FaceDetection],
    frame_timestamp: f64,
    index: &GalleryIndex,
    threshold: f32,
) -> RecognitionResult<Vec<MatchResult>> {
    faces
        .iter()
        .map(|face| {
            let best = index.best_match(&face.embedding)?;
            Ok(match best {
                Some(hit) => {
                    let recognized = hit.similarity >= threshold;
                    MatchResult {
                        bbox: face.bbox,
                        frame_timestamp,
                        best_identity_id: Some(hit.record.identity_id.clone()),
                        display_name: Some(hit.record.display_name.clone()),
                        group_label: Some(hit.record.group_label.clone()),
                        reference_image_path: hit
                            .record
                            .reference_image_path
                            .clone()
                            .filter(|_| recognized),
                        similarity: hit.similarity,
                        recognized,
                    }
                }
                None => MatchResult {
                    bbox: face.bbox,
                    frame_timestamp,
                    best_identity_id: None,
                    display_name: None,
                    group_label: None,
                    reference_image_path: None,
                    similarity: 0.0,
                    recognized: false,
                },
            })
        })
        .collect()
}
