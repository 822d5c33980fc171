//! Gallery of enrolled identities and exact nearest-neighbor search over it.

pub mod cache;
pub mod store;

pub use cache::IndexCache;
pub use store::{GalleryStore, MemoryGalleryStore, SqliteGalleryStore};

use crate::embedding::{cosine_similarity, l2_normalize};
use crate::error::{RecognitionError, RecognitionResult};
use common::recognition::GalleryRecord;

/// One search result
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub similarity: f32,
    /// Insertion position of the record in the index
    pub row: usize,
    pub record: &'a GalleryRecord,
}

/// Immutable snapshot of the gallery with unit-normalized embeddings
///
/// Row `i` of the vector table belongs to `records[i]`. A new gallery state
/// means a new index; nothing is mutated in place.
#[derive(Debug, Clone, Default)]
pub struct GalleryIndex {
    records: Vec<GalleryRecord>,
    /// Row-major `records.len() x dimension` matrix
    vectors: Vec<f32>,
    dimension: usize,
    version: u64,
}

impl GalleryIndex {
    /// Normalize and index every record, keeping their order
    pub fn build(records: Vec<GalleryRecord>) -> RecognitionResult<Self> {
        let dimension = match records.first() {
            Some(first) => first.embedding.len(),
            None => return Ok(Self::default()),
        };

        if dimension == 0 {
            return Err(RecognitionError::InvalidEmbedding(format!(
                "identity '{}' has an empty embedding",
                records[0].identity_id
            )));
        }

        let mut vectors = Vec::with_capacity(records.len() * dimension);
        for record in &records {
            if record.embedding.len() != dimension {
                return Err(RecognitionError::DimensionMismatch {
                    expected: dimension,
                    actual: record.embedding.len(),
                });
            }
            let normalized = l2_normalize(&record.embedding).map_err(|e| {
                RecognitionError::InvalidEmbedding(format!("identity '{}': {}", record.identity_id, e))
            })?;
            vectors.extend_from_slice(&normalized);
        }

        Ok(Self {
            records,
            vectors,
            dimension,
            version: 0,
        })
    }

    /// Tag the index with the gallery version it was built from
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True for an index built from an empty gallery
    pub fn no_records(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.no_records()
    }

    /// Embedding dimension, `None` for an empty index
    pub fn dimension(&self) -> Option<usize> {
        if self.no_records() {
            None
        } else {
            Some(self.dimension)
        }
    }

    pub fn records(&self) -> &[GalleryRecord] {
        &self.records
    }

    /// Normalized embedding stored for `row`
    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    /// Top-`k` records by descending cosine similarity to `query`
    ///
    /// Equal similarities are ordered by insertion position. An empty index
    /// yields an empty result for any query.
    pub fn search(&self, query: &[f32], k: usize) -> RecognitionResult<Vec<SearchHit<'_>>> {
        if self.no_records() || k == 0 {
            return Ok(Vec::new());
        }

        if query.len() != self.dimension {
            return Err(RecognitionError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let query = l2_normalize(query)?;

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .map(|row| cosine_similarity(&query, row))
            .enumerate()
            .collect();

        // Stable sort keeps lower rows first among equal scores
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(row, similarity)| SearchHit {
                similarity,
                row,
                record: &self.records[row],
            })
            .collect())
    }

    /// Best match for `query`, `None` on an empty index
    pub fn best_match(&self, query: &[f32]) -> RecognitionResult<Option<SearchHit<'_>>> {
        Ok(self.search(query, 1)?.into_iter().next())
    }
}
