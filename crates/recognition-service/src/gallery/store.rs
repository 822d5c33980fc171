//! Enrolled-identity storage
//!
//! The recognition core only reads snapshots; every mutation bumps a version
//! counter so cached indexes can tell when they are stale. Stores hold a
//! single embedding dimension: an insert whose embedding length differs from
//! the other records fails with [`RecognitionError::DimensionMismatch`]
//! wrapped in the returned error.

use crate::error::RecognitionError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use common::recognition::GalleryRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[async_trait]
pub trait GalleryStore: Send + Sync {
    /// All records in enrollment order
    async fn snapshot(&self) -> Result<Vec<GalleryRecord>>;

    /// Monotonically increasing counter, bumped by every mutation
    async fn version(&self) -> Result<u64>;

    /// Insert a record, replacing any record with the same identity ID
    ///
    /// Returns the replaced record.
    async fn insert(&self, record: GalleryRecord) -> Result<Option<GalleryRecord>>;

    /// Remove a record, returning it if it existed
    async fn remove(&self, identity_id: &str) -> Result<Option<GalleryRecord>>;

    async fn len(&self) -> Result<usize> {
        Ok(self.snapshot().await?.len())
    }
}

/// Reject `actual` unless it matches the dimension already stored
fn check_dimension(stored: Option<usize>, actual: usize) -> Result<()> {
    match stored {
        Some(expected) if expected != actual => {
            Err(RecognitionError::DimensionMismatch { expected, actual }.into())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryGallery {
    records: Vec<GalleryRecord>,
    version: u64,
}

/// Process-local gallery, used in standalone mode and tests
#[derive(Default)]
pub struct MemoryGalleryStore {
    inner: RwLock<MemoryGallery>,
}

impl MemoryGalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<GalleryRecord>) -> Self {
        Self {
            inner: RwLock::new(MemoryGallery {
                records,
                version: 1,
            }),
        }
    }
}

#[async_trait]
impl GalleryStore for MemoryGalleryStore {
    async fn snapshot(&self) -> Result<Vec<GalleryRecord>> {
        Ok(self.inner.read().await.records.clone())
    }

    async fn version(&self) -> Result<u64> {
        Ok(self.inner.read().await.version)
    }

    async fn insert(&self, record: GalleryRecord) -> Result<Option<GalleryRecord>> {
        let mut gallery = self.inner.write().await;

        let stored = gallery
            .records
            .iter()
            .find(|r| r.identity_id != record.identity_id)
            .map(|r| r.embedding.len());
        check_dimension(stored, record.embedding.len())?;

        let replaced = match gallery
            .records
            .iter_mut()
            .find(|r| r.identity_id == record.identity_id)
        {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                gallery.records.push(record);
                None
            }
        };
        gallery.version += 1;
        Ok(replaced)
    }

    async fn remove(&self, identity_id: &str) -> Result<Option<GalleryRecord>> {
        let mut gallery = self.inner.write().await;
        let Some(position) = gallery
            .records
            .iter()
            .position(|r| r.identity_id == identity_id)
        else {
            return Ok(None);
        };
        let removed = gallery.records.remove(position);
        gallery.version += 1;
        Ok(Some(removed))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.read().await.records.len())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[derive(sqlx::FromRow)]
struct FaceRow {
    identity_id: String,
    display_name: String,
    group_label: String,
    embedding: Vec<u8>,
    reference_image_path: Option<String>,
    enrolled_at: i64,
}

impl TryFrom<FaceRow> for GalleryRecord {
    type Error = anyhow::Error;

    fn try_from(row: FaceRow) -> Result<Self> {
        let embedding = decode_embedding(&row.embedding)
            .with_context(|| format!("corrupt embedding for identity '{}'", row.identity_id))?;
        Ok(GalleryRecord {
            identity_id: row.identity_id,
            display_name: row.display_name,
            group_label: row.group_label,
            embedding,
            reference_image_path: row.reference_image_path,
            enrolled_at: row.enrolled_at.max(0) as u64,
        })
    }
}

/// Pack an embedding as little-endian `f32` values
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(anyhow!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Gallery persisted in SQLite
///
/// Mutations are serialized so the dimension check and the write it guards
/// see the same table.
#[derive(Clone)]
pub struct SqliteGalleryStore {
    pool: SqlitePool,
    writes: Arc<Mutex<()>>,
}

impl SqliteGalleryStore {
    /// Open (creating if needed) the database at `database_url` and run migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid gallery database URL '{}'", database_url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to connect to gallery database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run gallery migrations")?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writes: Arc::new(Mutex::new(())),
        }
    }
}

const FACE_COLUMNS: &str =
    "identity_id, display_name, group_label, embedding, reference_image_path, enrolled_at";

#[async_trait]
impl GalleryStore for SqliteGalleryStore {
    async fn snapshot(&self) -> Result<Vec<GalleryRecord>> {
        let rows = sqlx::query_as::<_, FaceRow>(&format!(
            "SELECT {} FROM faces ORDER BY rowid",
            FACE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to load gallery")?;

        rows.into_iter().map(GalleryRecord::try_from).collect()
    }

    async fn version(&self) -> Result<u64> {
        let version: i64 = sqlx::query_scalar("SELECT version FROM gallery_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("failed to read gallery version")?;
        Ok(version.max(0) as u64)
    }

    async fn insert(&self, record: GalleryRecord) -> Result<Option<GalleryRecord>> {
        let _guard = self.writes.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin gallery transaction")?;

        let stored: Option<i64> = sqlx::query_scalar(
            "SELECT length(embedding) FROM faces WHERE identity_id != $1 LIMIT 1",
        )
        .bind(&record.identity_id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to read gallery dimension")?;
        check_dimension(
            stored.map(|bytes| bytes.max(0) as usize / 4),
            record.embedding.len(),
        )?;

        let replaced = sqlx::query_as::<_, FaceRow>(&format!(
            "SELECT {} FROM faces WHERE identity_id = $1",
            FACE_COLUMNS
        ))
        .bind(&record.identity_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to load identity '{}'", record.identity_id))?
        .map(GalleryRecord::try_from)
        .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO faces (identity_id, display_name, group_label, embedding, reference_image_path, enrolled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(identity_id) DO UPDATE SET
                display_name = excluded.display_name,
                group_label = excluded.group_label,
                embedding = excluded.embedding,
                reference_image_path = excluded.reference_image_path,
                enrolled_at = excluded.enrolled_at
            "#,
        )
        .bind(&record.identity_id)
        .bind(&record.display_name)
        .bind(&record.group_label)
        .bind(encode_embedding(&record.embedding))
        .bind(&record.reference_image_path)
        .bind(record.enrolled_at as i64)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to store identity '{}'", record.identity_id))?;

        bump_version(&mut tx).await?;

        tx.commit()
            .await
            .context("failed to commit gallery transaction")?;
        Ok(replaced)
    }

    async fn remove(&self, identity_id: &str) -> Result<Option<GalleryRecord>> {
        let _guard = self.writes.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin gallery transaction")?;

        let removed = sqlx::query_as::<_, FaceRow>(&format!(
            "DELETE FROM faces WHERE identity_id = $1 RETURNING {}",
            FACE_COLUMNS
        ))
        .bind(identity_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("failed to remove identity '{}'", identity_id))?
        .map(GalleryRecord::try_from)
        .transpose()?;

        if removed.is_some() {
            bump_version(&mut tx).await?;
        }

        tx.commit()
            .await
            .context("failed to commit gallery transaction")?;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM faces")
            .fetch_one(&self.pool)
            .await
            .context("failed to count gallery records")?;
        Ok(count.max(0) as usize)
    }
}

async fn bump_version(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query("UPDATE gallery_state SET version = version + 1 WHERE id = 1")
        .execute(&mut **tx)
        .await
        .context("failed to bump gallery version")?;
    Ok(())
}
