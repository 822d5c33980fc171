use image::{ImageFormat, RgbImage};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persists the representative face crop of each appearance event
#[derive(Debug, Clone, Default)]
pub struct CropWriter {
    root: Option<PathBuf>,
}

impl CropWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Writer that keeps no crops
    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Directory holding every crop of one task
    pub fn task_dir(&self, task_id: &str) -> Option<PathBuf> {
        Some(self.root.as_ref()?.join(encode_component(task_id)))
    }

    /// Path of the crop for an event starting at `start_time` seconds
    pub fn crop_path(&self, task_id: &str, identity_id: &str, start_time: f64) -> Option<PathBuf> {
        let start_ms = (start_time.max(0.0) * 1000.0).round() as u64;
        Some(
            self.task_dir(task_id)?
                .join(format!("{}_{}.jpg", encode_component(identity_id), start_ms)),
        )
    }

    /// Save `crop` as JPEG, returning its reference
    ///
    /// Failures are logged and yield `None`; a missing crop never fails a task.
    pub async fn save(
        &self,
        task_id: &str,
        identity_id: &str,
        start_time: f64,
        crop: RgbImage,
    ) -> Option<String> {
        let path = self.crop_path(task_id, identity_id, start_time)?;
        let saved = write_jpeg(path, crop).await?;
        debug!(path = %saved, "saved appearance crop");
        Some(saved)
    }

    /// Delete every crop written for `task_id`
    pub async fn discard(&self, task_id: &str) {
        let Some(dir) = self.task_dir(task_id) else {
            return;
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "discarded appearance crops"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "failed to discard crops"),
        }
    }
}

/// Keeps the image each identity was enrolled from
#[derive(Debug, Clone, Default)]
pub struct ReferenceImages {
    root: Option<PathBuf>,
}

impl ReferenceImages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { root: None }
    }

    /// Save the enrollment image of `identity_id`
    ///
    /// Every call writes a new file so a replaced enrollment keeps its image
    /// until the replacement is committed.
    pub async fn save(&self, identity_id: &str, image: RgbImage) -> Option<String> {
        let root = self.root.as_ref()?;
        let path = root.join(format!(
            "{}_{}.jpg",
            encode_component(identity_id),
            uuid::Uuid::new_v4().simple()
        ));
        let saved = write_jpeg(path, image).await?;
        debug!(identity_id, path = %saved, "saved reference image");
        Some(saved)
    }

    /// Delete a reference image previously returned by [`save`](Self::save)
    ///
    /// Paths outside the configured directory are left alone.
    pub async fn remove(&self, reference: &str) {
        let Some(root) = self.root.as_ref() else {
            return;
        };
        let path = Path::new(reference);
        if path.parent() != Some(root.as_path()) {
            debug!(path = reference, "reference image is not managed here");
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = reference, "removed reference image"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = reference, error = %e, "failed to remove reference image"),
        }
    }
}

async fn write_jpeg(path: PathBuf, image: RgbImage) -> Option<String> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), error = %e, "failed to create image directory");
            return None;
        }
    }

    let target = path.clone();
    let written =
        tokio::task::spawn_blocking(move || image.save_with_format(&target, ImageFormat::Jpeg))
            .await;

    match written {
        Ok(Ok(())) => Some(path.display().to_string()),
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "failed to encode image");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "image writer task failed");
            None
        }
    }
}

/// Map an ID onto a file name component without collisions
///
/// ASCII letters, digits and `-` pass through. Every other byte, `_`
/// included, becomes `_` plus two hex digits.
fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_path_layout() {
        let writer = CropWriter::new("/var/crops");
        let path = writer.crop_path("task-1", "suspect.7", 12.3456).unwrap();
        assert_eq!(path, PathBuf::from("/var/crops/task-1/suspect_2e7_12346.jpg"));
        assert!(CropWriter::disabled().crop_path("t", "i", 0.0).is_none());
    }

    #[test]
    fn test_similar_ids_get_distinct_paths() {
        let writer = CropWriter::new("/var/crops");
        let ids = ["suspect.7", "suspect_7", "suspect 7", "suspect_2e7", "suspect-7"];
        let paths: std::collections::HashSet<PathBuf> = ids
            .iter()
            .map(|id| writer.crop_path("t", id, 1.0).unwrap())
            .collect();
        assert_eq!(paths.len(), ids.len());
        assert_eq!(encode_component("Jörg"), "J_c3_b6rg");
    }

    #[tokio::test]
    async fn test_crops_of_similar_ids_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CropWriter::new(dir.path());

        let dotted = writer
            .save("t", "suspect.7", 1.0, RgbImage::new(2, 2))
            .await
            .unwrap();
        let underscored = writer
            .save("t", "suspect_7", 1.0, RgbImage::new(4, 4))
            .await
            .unwrap();

        assert_ne!(dotted, underscored);
        assert_eq!(image::open(&dotted).unwrap().width(), 2);
        assert_eq!(image::open(&underscored).unwrap().width(), 4);
    }

    #[tokio::test]
    async fn test_save_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CropWriter::new(dir.path());

        let reference = writer
            .save("task-1", "alice", 2.0, RgbImage::new(8, 8))
            .await
            .unwrap();

        let saved = PathBuf::from(&reference);
        assert!(saved.ends_with("task-1/alice_2000.jpg"));
        let decoded = image::open(&saved).unwrap();
        assert_eq!(decoded.width(), 8);
    }

    #[tokio::test]
    async fn test_save_failure_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let writer = CropWriter::new(&blocker);
        assert!(writer.save("task", "bob", 0.0, RgbImage::new(4, 4)).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_writer_skips() {
        assert!(CropWriter::disabled()
            .save("task", "bob", 0.0, RgbImage::new(4, 4))
            .await
            .is_none());
        CropWriter::disabled().discard("task").await;
    }

    #[tokio::test]
    async fn test_discard_removes_task_crops_only() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CropWriter::new(dir.path());
        let kept = writer.save("kept", "bob", 0.0, RgbImage::new(4, 4)).await.unwrap();
        writer.save("dropped", "bob", 0.0, RgbImage::new(4, 4)).await.unwrap();

        writer.discard("dropped").await;
        writer.discard("never-ran").await;

        assert!(!dir.path().join("dropped").exists());
        assert!(Path::new(&kept).exists());
    }

    #[tokio::test]
    async fn test_reference_images_save_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let references = ReferenceImages::new(dir.path());

        let first = references.save("carol", RgbImage::new(6, 6)).await.unwrap();
        let second = references.save("carol", RgbImage::new(6, 6)).await.unwrap();
        assert_ne!(first, second);
        assert!(Path::new(&first).starts_with(dir.path()));
        assert_eq!(image::open(&first).unwrap().height(), 6);

        references.remove(&first).await;
        assert!(!Path::new(&first).exists());
        assert!(Path::new(&second).exists());

        // Files outside the directory are never touched
        let outside = tempfile::NamedTempFile::new().unwrap();
        references.remove(&outside.path().display().to_string()).await;
        assert!(outside.path().exists());

        assert!(ReferenceImages::disabled()
            .save("carol", RgbImage::new(2, 2))
            .await
            .is_none());
    }
}
