use super::{GalleryIndex, GalleryStore};
use crate::error::{RecognitionError, RecognitionResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Last built index, rebuilt only when the store's version moves
pub struct IndexCache {
    store: Arc<dyn GalleryStore>,
    current: Mutex<Option<Arc<GalleryIndex>>>,
}

impl IndexCache {
    pub fn new(store: Arc<dyn GalleryStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn GalleryStore> {
        &self.store
    }

    /// Index matching the store's current version
    pub async fn current(&self) -> RecognitionResult<Arc<GalleryIndex>> {
        let version = self
            .store
            .version()
            .await
            .map_err(|e| RecognitionError::gallery(format!("{:#}", e)))?;

        let mut cached = self.current.lock().await;
        if let Some(index) = cached.as_ref() {
            if index.version() == version {
                debug!(version, "gallery index cache hit");
                return Ok(Arc::clone(index));
            }
        }

        let records = self
            .store
            .snapshot()
            .await
            .map_err(|e| RecognitionError::gallery(format!("{:#}", e)))?;
        let index = Arc::new(GalleryIndex::build(records)?.with_version(version));

        telemetry::metrics::RECOGNITION_INDEX_REBUILDS.inc();
        telemetry::metrics::RECOGNITION_GALLERY_SIZE.set(index.len() as i64);
        info!(
            version,
            records = index.len(),
            dimension = ?index.dimension(),
            "rebuilt gallery index"
        );

        *cached = Some(Arc::clone(&index));
        Ok(index)
    }
}
