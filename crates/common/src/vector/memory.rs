//! In-process vector backend with brute-force cosine search

use super::{
    sort_by_score, ChunkDocument, MetadataFilter, ScoredChunk, VectorCollection, VectorStore,
};
use crate::embeddings::{cosine_similarity, Embedder};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct StoredChunk {
    document: ChunkDocument,
    embedding: Vec<f32>,
}

type Collections = Arc<RwLock<HashMap<String, Vec<StoredChunk>>>>;

/// Vector store keeping every collection in memory
pub struct MemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    collections: Collections,
}

impl MemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn create_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.read().await.contains_key(name))
    }

    fn collection(&self, name: &str) -> Arc<dyn VectorCollection> {
        Arc::new(MemoryCollection {
            name: name.to_string(),
            embedder: self.embedder.clone(),
            collections: self.collections.clone(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryCollection {
    name: String,
    embedder: Arc<dyn Embedder>,
    collections: Collections,
}

impl MemoryCollection {
    fn missing(&self) -> AppError {
        AppError::CollectionNotFound {
            name: self.name.clone(),
        }
    }
}

#[async_trait]
impl VectorCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, documents: &[ChunkDocument]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        // Embed first; the batch is appended in one step or not at all
        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != documents.len() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "expected {} embeddings, received {}",
                    documents.len(),
                    embeddings.len()
                ),
            });
        }

        let mut collections = self.collections.write().await;
        let chunks = collections.get_mut(&self.name).ok_or_else(|| self.missing())?;
        chunks.extend(
            documents
                .iter()
                .cloned()
                .zip(embeddings)
                .map(|(document, embedding)| StoredChunk {
                    document,
                    embedding,
                }),
        );

        Ok(documents.len())
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let collections = self.collections.read().await;
        let chunks = collections.get(&self.name).ok_or_else(|| self.missing())?;

        let mut hits: Vec<ScoredChunk> = chunks
            .iter()
            .map(|chunk| ScoredChunk {
                text: chunk.document.text.clone(),
                metadata: chunk.document.metadata.clone(),
                score: cosine_similarity(&query_embedding, &chunk.embedding),
            })
            .collect();
        sort_by_score(&mut hits);
        hits.truncate(k);

        Ok(hits)
    }

    async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<u64> {
        filter.ensure_not_empty()?;

        let mut collections = self.collections.write().await;
        let chunks = collections.get_mut(&self.name).ok_or_else(|| self.missing())?;

        let before = chunks.len();
        chunks.retain(|chunk| !filter.matches(&chunk.document.metadata));

        Ok((before - chunks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbedder;
    use crate::vector::ChunkMetadata;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    fn store() -> MemoryVectorStore {
        MemoryVectorStore::new(Arc::new(MockEmbedder::new(1024)))
    }

    fn doc(text: &str, storage_id: Uuid, file_id: Uuid, page: u32) -> ChunkDocument {
        ChunkDocument {
            text: text.to_string(),
            metadata: ChunkMetadata {
                source: "notes.pdf".into(),
                page,
                storage_id,
                file_id,
                chunk_index: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_search_ranks_best_match_first() {
        let store = store();
        store.create_collection("docs").await.unwrap();
        let collection = store.collection("docs");
        let (storage, file) = (Uuid::new_v4(), Uuid::new_v4());

        collection
            .upsert(&[
                doc("Gamma Delta", storage, file, 2),
                doc("Alpha Beta", storage, file, 1),
            ])
            .await
            .unwrap();

        let hits = collection.similarity_search("Alpha", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.page, 1);
        assert!(hits[0].score >= hits[1].score);

        let top_one = collection.similarity_search("Alpha", 1).await.unwrap();
        assert_eq!(top_one.len(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = store();
        store.create_collection("a").await.unwrap();
        store.create_collection("b").await.unwrap();
        let (storage, file) = (Uuid::new_v4(), Uuid::new_v4());

        store
            .collection("a")
            .upsert(&[doc("Alpha", storage, file, 1)])
            .await
            .unwrap();

        assert!(store
            .collection("b")
            .similarity_search("Alpha", 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_filter_is_idempotent() {
        let store = store();
        store.create_collection("docs").await.unwrap();
        let collection = store.collection("docs");
        let storage = Uuid::new_v4();
        let (removed, kept) = (Uuid::new_v4(), Uuid::new_v4());

        collection
            .upsert(&[
                doc("Alpha", storage, removed, 1),
                doc("Alpha again", storage, removed, 2),
                doc("Beta", storage, kept, 1),
            ])
            .await
            .unwrap();

        let filter = MetadataFilter::for_item(storage, removed);
        assert_eq!(collection.delete_by_filter(&filter).await.unwrap(), 2);
        assert_eq!(collection.delete_by_filter(&filter).await.unwrap(), 0);

        let hits = collection.similarity_search("Alpha", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.file_id, kept);
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let store = store();
        let collection = store.collection("ghost");

        let err = collection.similarity_search("x", 3).await.unwrap_err();
        assert!(matches!(err, AppError::CollectionNotFound { .. }));

        let err = collection
            .upsert(&[doc("x", Uuid::new_v4(), Uuid::new_v4(), 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CollectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_drop_collection() {
        let store = store();
        store.create_collection("docs").await.unwrap();
        assert!(store.collection_exists("docs").await.unwrap());

        assert_ok!(store.drop_collection("docs").await);
        assert_ok!(store.drop_collection("docs").await);
        assert!(!store.collection_exists("docs").await.unwrap());
    }
}
