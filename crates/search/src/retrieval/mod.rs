//! Storage-scoped retrieval
//!
//! Scores are cosine similarity from the vector backend: higher is more
//! similar and hits are returned in descending score order.

use async_trait::async_trait;
use cevra_common::db::Repository;
use cevra_common::errors::{AppError, Result};
use cevra_common::metrics::record_search;
use cevra_common::vector::{ScoredChunk, VectorStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Retrieved passage with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub content: String,
    /// File name the passage was extracted from
    pub source: String,
    pub page: u32,
    pub file_id: Uuid,
    pub storage_id: Uuid,
    pub score: f32,
}

impl From<ScoredChunk> for SearchHit {
    fn from(chunk: ScoredChunk) -> Self {
        Self {
            content: chunk.text,
            source: chunk.metadata.source,
            page: chunk.metadata.page,
            file_id: chunk.metadata.file_id,
            storage_id: chunk.metadata.storage_id,
            score: chunk.score,
        }
    }
}

/// Common trait for retrievers
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Top `k` passages of one storage for the query, best first
    async fn retrieve(&self, query: &str, storage_id: Uuid, k: usize) -> Result<Vec<SearchHit>>;
}

/// Retrieval backed by the storage catalog and the vector store
#[derive(Clone)]
pub struct RetrievalService {
    repository: Repository,
    vectors: Arc<dyn VectorStore>,
    top_k: usize,
}

impl RetrievalService {
    pub fn new(repository: Repository, vectors: Arc<dyn VectorStore>, top_k: usize) -> Self {
        Self {
            repository,
            vectors,
            top_k: top_k.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Search with the configured result count
    pub async fn search(&self, query: &str, storage_id: Uuid) -> Result<Vec<SearchHit>> {
        self.retrieve(query, storage_id, self.top_k).await
    }
}

#[async_trait]
impl Retriever for RetrievalService {
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    async fn retrieve(&self, query: &str, storage_id: Uuid, k: usize) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::validation("query", "query must not be blank"));
        }

        let storage = self
            .repository
            .find_storage(storage_id)
            .await?
            .ok_or_else(|| AppError::StorageNotFound {
                id: storage_id.to_string(),
            })?;

        let start = Instant::now();
        let hits: Vec<SearchHit> = self
            .vectors
            .collection(&storage.collection_name)
            .similarity_search(query, k)
            .await?
            .into_iter()
            .map(SearchHit::from)
            .collect();

        record_search(start.elapsed().as_secs_f64(), hits.len());
        debug!(result_count = hits.len(), "Search completed");

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cevra_common::config::IngestionConfig;
    use cevra_common::db::DbPool;
    use cevra_common::embeddings::MockEmbedder;
    use cevra_common::vector::MemoryVectorStore;
    use cevra_ingestion::pdf::fixtures::sample_pdf;
    use cevra_ingestion::{IngestionPipeline, StorageCatalog, UploadedFile};

    struct Fixture {
        service: RetrievalService,
        catalog: StorageCatalog,
        pipeline: IngestionPipeline,
    }

    async fn fixture() -> Fixture {
        let repo = Repository::new(DbPool::in_memory().await.unwrap());
        let vectors: Arc<dyn VectorStore> =
            Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(1024))));

        Fixture {
            service: RetrievalService::new(repo.clone(), vectors.clone(), 5),
            catalog: StorageCatalog::new(repo.clone(), vectors.clone()),
            pipeline: IngestionPipeline::new(repo, vectors, &IngestionConfig::default()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_two_page_document_scenario() {
        let fx = fixture().await;
        let storage = fx.catalog.create_storage("Docs".into(), None).await.unwrap();
        let pdf = sample_pdf(&["Alpha Beta", "Gamma Delta"]);
        let item_id = fx
            .pipeline
            .ingest(
                UploadedFile::new("greek.pdf", "application/pdf", Bytes::from(pdf)),
                storage.id,
            )
            .await
            .unwrap();

        let hits = fx.service.search("Alpha", storage.id).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].page, 1);
        assert_eq!(hits[0].source, "greek.pdf");
        assert_eq!(hits[0].file_id, item_id);
        assert_eq!(hits[0].storage_id, storage.id);
        assert!(hits[0].score > hits[1].score);

        let json = serde_json::to_value(&hits[0]).unwrap();
        assert_eq!(json["fileId"], item_id.to_string());
    }

    #[tokio::test]
    async fn test_limit_and_empty_storage() {
        let fx = fixture().await;
        let storage = fx.catalog.create_storage("Docs".into(), None).await.unwrap();

        assert!(fx.service.search("anything", storage.id).await.unwrap().is_empty());

        for i in 0..4 {
            let pdf = sample_pdf(&[&format!("Alpha document {}", i)]);
            fx.pipeline
                .ingest(
                    UploadedFile::new("a.pdf", "application/pdf", Bytes::from(pdf)),
                    storage.id,
                )
                .await
                .unwrap();
        }
        assert_eq!(fx.service.retrieve("Alpha", storage.id, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_storages_are_isolated() {
        let fx = fixture().await;
        let left = fx.catalog.create_storage("left".into(), None).await.unwrap();
        let right = fx.catalog.create_storage("right".into(), None).await.unwrap();
        fx.pipeline
            .ingest(
                UploadedFile::new("l.pdf", "application/pdf", Bytes::from(sample_pdf(&["Alpha"]))),
                left.id,
            )
            .await
            .unwrap();

        assert!(fx.service.search("Alpha", right.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errors() {
        let fx = fixture().await;
        assert!(matches!(
            fx.service.search("Alpha", Uuid::new_v4()).await,
            Err(AppError::StorageNotFound { .. })
        ));

        let storage = fx.catalog.create_storage("Docs".into(), None).await.unwrap();
        assert!(matches!(
            fx.service.search("   ", storage.id).await,
            Err(AppError::Validation { .. })
        ));
    }
}
