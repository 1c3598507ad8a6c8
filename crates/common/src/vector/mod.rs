//! Vector index adapter
//!
//! A [`VectorStore`] is the backend handle; it manages collections and hands
//! out [`VectorCollection`] capability objects bound to one collection name.
//! Ingestion, retrieval and the agent receive those objects explicitly and
//! never reach for a process-wide store.
//!
//! Scores are cosine similarity: higher means more similar.

mod memory;
mod postgres;

pub use self::memory::MemoryVectorStore;
pub use self::postgres::PgVectorStore;

use crate::config::VectorConfig;
use crate::db::DbPool;
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Metadata stored next to every chunk vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Original file name
    pub source: String,
    /// 1-indexed page number
    pub page: u32,
    pub storage_id: Uuid,
    /// Id of the item the chunk was extracted from
    pub file_id: Uuid,
    /// Position of the chunk within its page
    pub chunk_index: u32,
}

/// Text plus metadata, ready to be embedded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Search hit with its similarity score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Conjunction of metadata equality constraints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub storage_id: Option<Uuid>,
    pub file_id: Option<Uuid>,
}

impl MetadataFilter {
    /// Everything that came out of one uploaded file
    pub fn for_item(storage_id: Uuid, file_id: Uuid) -> Self {
        Self {
            storage_id: Some(storage_id),
            file_id: Some(file_id),
        }
    }

    pub fn for_storage(storage_id: Uuid) -> Self {
        Self {
            storage_id: Some(storage_id),
            file_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.storage_id.is_none() && self.file_id.is_none()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.storage_id.map_or(true, |id| id == metadata.storage_id)
            && self.file_id.map_or(true, |id| id == metadata.file_id)
    }

    /// An empty filter would purge the whole collection
    fn ensure_not_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Err(AppError::Validation {
                message: "delete filter needs at least one constraint".to_string(),
                field: None,
            });
        }
        Ok(())
    }
}

/// Operations on one named collection
#[async_trait]
pub trait VectorCollection: Send + Sync {
    fn name(&self) -> &str;

    /// Embed and store a batch. Either the whole batch becomes visible or
    /// none of it does. Returns the number of stored chunks.
    async fn upsert(&self, documents: &[ChunkDocument]) -> Result<usize>;

    /// At most `k` chunks, best match first
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>>;

    /// Remove every chunk matching the filter. Deleting nothing is not an error.
    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<u64>;
}

/// Backend handle managing collections
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a collection; creating an existing one is a no-op
    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Drop a collection and its chunks; dropping a missing one is a no-op
    async fn drop_collection(&self, name: &str) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Capability object for one collection. Existence is checked on use.
    fn collection(&self, name: &str) -> Arc<dyn VectorCollection>;

    fn backend_name(&self) -> &'static str;
}

/// Create the configured vector backend
pub async fn create_vector_store(
    config: &VectorConfig,
    db: &DbPool,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "pgvector" => {
            let store = PgVectorStore::from_pool(db, embedder)?;
            store.initialize().await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryVectorStore::new(embedder))),
        other => Err(AppError::Configuration {
            message: format!("unknown vector backend '{}'", other),
        }),
    }
}

fn sort_by_score(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
}
