//! Ingestion pipeline
//!
//! Extractor -> chunker -> vector collection, with one catalog item per
//! uploaded file. A failed run removes every chunk it wrote before the
//! item is marked failed, so only successful items have vectors.

use crate::chunker::Chunker;
use crate::pdf::extract_pages_blocking;
use bytes::Bytes;
use cevra_common::config::IngestionConfig;
use cevra_common::db::models::{Item, Storage};
use cevra_common::db::Repository;
use cevra_common::errors::{AppError, Result};
use cevra_common::metrics::record_ingestion;
use cevra_common::vector::{ChunkDocument, ChunkMetadata, MetadataFilter, VectorStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// File received from a client
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub bytes: Bytes,
    pub name: String,
    pub mime_type: String,
    /// Declared size in bytes
    pub size: u64,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            size: bytes.len() as u64,
            bytes,
            name: name.into(),
            mime_type: mime_type.into(),
        }
    }

    fn effective_size(&self) -> u64 {
        self.size.max(self.bytes.len() as u64)
    }

    /// MIME type without parameters, lower-cased
    fn essence(&self) -> String {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

pub struct IngestionPipeline {
    repository: Repository,
    vectors: Arc<dyn VectorStore>,
    chunker: Chunker,
    max_file_size: u64,
    allowed_mime_types: Vec<String>,
}

impl IngestionPipeline {
    pub fn new(
        repository: Repository,
        vectors: Arc<dyn VectorStore>,
        config: &IngestionConfig,
    ) -> Result<Self> {
        Ok(Self {
            repository,
            vectors,
            chunker: Chunker::from_config(config)?,
            max_file_size: config.max_file_size_bytes,
            allowed_mime_types: config
                .allowed_mime_types
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
        })
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Type first, then size. Nothing is written when this fails.
    pub fn validate(&self, file: &UploadedFile) -> Result<()> {
        if !self.allowed_mime_types.contains(&file.essence()) {
            return Err(AppError::UnsupportedFileType {
                mime_type: file.mime_type.clone(),
            });
        }

        let size = file.effective_size();
        if size > self.max_file_size {
            return Err(AppError::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        Ok(())
    }

    async fn prepare(&self, file: &UploadedFile, storage_id: Uuid) -> Result<(Storage, Item)> {
        self.validate(file)?;

        let storage = self
            .repository
            .find_storage_primary(storage_id)
            .await?
            .ok_or_else(|| AppError::StorageNotFound {
                id: storage_id.to_string(),
            })?;

        let item = self
            .repository
            .create_item(
                storage.id,
                file.name.clone(),
                file.essence(),
                file.effective_size(),
            )
            .await?;

        Ok((storage, item))
    }

    /// Ingest a file and wait for the outcome. Returns the item id.
    #[instrument(skip(self, file), fields(file = %file.name, size = file.size))]
    pub async fn ingest(&self, file: UploadedFile, storage_id: Uuid) -> Result<Uuid> {
        let (storage, item) = self.prepare(&file, storage_id).await?;
        self.run(&storage, &item, file.bytes).await?;
        Ok(item.id)
    }

    /// Validate and record the item, then index in the background.
    /// The returned item is still `pending`; poll it for the outcome.
    #[instrument(skip(self, file), fields(file = %file.name, size = file.size))]
    pub async fn submit(self: &Arc<Self>, file: UploadedFile, storage_id: Uuid) -> Result<Item> {
        let (storage, item) = self.prepare(&file, storage_id).await?;

        let pipeline = Arc::clone(self);
        let pending = item.clone();
        let span = tracing::info_span!("ingestion_task", item_id = %item.id);
        tokio::spawn(
            async move {
                // The outcome is recorded on the item
                let _ = pipeline.run(&storage, &pending, file.bytes).await;
            }
            .instrument(span),
        );

        Ok(item)
    }

    async fn run(&self, storage: &Storage, item: &Item, bytes: Bytes) -> Result<usize> {
        let start = Instant::now();
        info!(item_id = %item.id, storage_id = %storage.id, "Ingestion started");

        let chunk_count = match self.index(storage, item, bytes).await {
            Ok(chunk_count) => chunk_count,
            Err(err) => {
                error!(item_id = %item.id, error = %err, "Ingestion failed");
                self.rollback(storage, item).await;

                if let Err(mark_err) = self
                    .repository
                    .fail_item(item.id, &err.public_message())
                    .await
                {
                    warn!(item_id = %item.id, error = %mark_err, "Could not mark item failed");
                }
                record_ingestion(start.elapsed().as_secs_f64(), 0, "failed");
                return Err(err);
            }
        };

        // Chunks only survive a successful transition out of `pending`
        if let Err(err) = self.repository.complete_item(item.id, chunk_count).await {
            self.rollback(storage, item).await;

            let outcome = match &err {
                AppError::Conflict { .. } | AppError::ItemNotFound { .. } => {
                    info!(item_id = %item.id, "Item withdrawn during ingestion, chunks dropped");
                    "cancelled"
                }
                _ => {
                    error!(item_id = %item.id, error = %err, "Could not record ingestion");
                    if let Err(mark_err) = self
                        .repository
                        .fail_item(item.id, &err.public_message())
                        .await
                    {
                        warn!(item_id = %item.id, error = %mark_err, "Could not mark item failed");
                    }
                    "failed"
                }
            };
            record_ingestion(start.elapsed().as_secs_f64(), 0, outcome);
            return Err(err);
        }

        record_ingestion(start.elapsed().as_secs_f64(), chunk_count, "success");
        info!(item_id = %item.id, chunk_count, "Ingestion completed");
        Ok(chunk_count)
    }

    async fn index(&self, storage: &Storage, item: &Item, bytes: Bytes) -> Result<usize> {
        let pages = extract_pages_blocking(bytes).await?;
        let collection = self.vectors.collection(&storage.collection_name);

        let mut total = 0;
        for page in pages {
            let documents: Vec<ChunkDocument> = self
                .chunker
                .split(&page.text)
                .into_iter()
                .filter(|chunk| !chunk.content.trim().is_empty())
                .map(|chunk| ChunkDocument {
                    text: chunk.content,
                    metadata: ChunkMetadata {
                        source: item.name.clone(),
                        page: page.page_number,
                        storage_id: storage.id,
                        file_id: item.id,
                        chunk_index: chunk.index as u32,
                    },
                })
                .collect();

            if documents.is_empty() {
                debug!(page = page.page_number, "Page has no text, skipping");
                continue;
            }

            total += collection.upsert(&documents).await?;
        }

        Ok(total)
    }

    async fn rollback(&self, storage: &Storage, item: &Item) {
        let collection = self.vectors.collection(&storage.collection_name);
        match collection
            .delete_by_filter(&MetadataFilter::for_item(storage.id, item.id))
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(item_id = %item.id, removed, "Partial ingestion rolled back"),
            Err(e) => warn!(item_id = %item.id, error = %e, "Rollback failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::sample_pdf;
    use async_trait::async_trait;
    use cevra_common::db::models::ItemStatus;
    use cevra_common::db::DbPool;
    use cevra_common::embeddings::MockEmbedder;
    use cevra_common::vector::{MemoryVectorStore, ScoredChunk, VectorCollection};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        repo: Repository,
        vectors: Arc<dyn VectorStore>,
        pipeline: Arc<IngestionPipeline>,
        storage: Storage,
    }

    async fn fixture_with(vectors: Arc<dyn VectorStore>) -> Fixture {
        let repo = Repository::new(DbPool::in_memory().await.unwrap());
        vectors.create_collection("docs_1").await.unwrap();
        let storage = repo
            .create_storage("Docs".into(), None, "docs_1".into())
            .await
            .unwrap();
        let pipeline = Arc::new(
            IngestionPipeline::new(repo.clone(), vectors.clone(), &IngestionConfig::default())
                .unwrap(),
        );
        Fixture {
            repo,
            vectors,
            pipeline,
            storage,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(
            1024,
        )))))
        .await
    }

    fn pdf_file(pages: &[&str]) -> UploadedFile {
        UploadedFile::new("report.pdf", "application/pdf", Bytes::from(sample_pdf(pages)))
    }

    #[tokio::test]
    async fn test_ingest_then_retrieve() {
        let fx = fixture().await;
        let item_id = fx
            .pipeline
            .ingest(pdf_file(&["Alpha Beta", "Gamma Delta"]), fx.storage.id)
            .await
            .unwrap();

        let item = fx.repo.find_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.item_status(), ItemStatus::Success);
        assert_eq!(item.chunk_count, 2);

        let hits = fx
            .vectors
            .collection("docs_1")
            .similarity_search("Alpha", 5)
            .await
            .unwrap();
        assert_eq!(hits[0].metadata.page, 1);
        assert_eq!(hits[0].metadata.source, "report.pdf");
        assert_eq!(hits[0].metadata.file_id, item_id);
    }

    #[tokio::test]
    async fn test_blank_pages_are_skipped() {
        let fx = fixture().await;
        let item_id = fx
            .pipeline
            .ingest(pdf_file(&["", "Only text"]), fx.storage.id)
            .await
            .unwrap();

        let item = fx.repo.find_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.chunk_count, 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_type_before_any_write() {
        let fx = fixture().await;
        let file = UploadedFile::new("notes.txt", "text/plain", Bytes::from_static(b"hi"));

        let err = fx.pipeline.ingest(file, fx.storage.id).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFileType { .. }));
        assert!(fx.repo.list_items(fx.storage.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_oversized_file() {
        let fx = fixture().await;
        let file = UploadedFile::new(
            "big.pdf",
            "application/pdf",
            Bytes::from(vec![0u8; 10 * 1024 * 1024 + 1]),
        );

        let err = fx.pipeline.ingest(file, fx.storage.id).await.unwrap_err();
        assert!(matches!(err, AppError::FileTooLarge { .. }));
        assert!(fx.repo.list_items(fx.storage.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_storage() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .ingest(pdf_file(&["x"]), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StorageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_pdf_marks_item_failed() {
        let fx = fixture().await;
        let file = UploadedFile::new("fake.pdf", "application/pdf", Bytes::from_static(b"nope"));

        let err = fx.pipeline.ingest(file, fx.storage.id).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat { .. }));

        let items = fx.repo.list_items(fx.storage.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_status(), ItemStatus::Failed);
        assert!(items[0].error_message.is_some());
    }

    /// Fails the nth upsert across all collections. With `cancel_via`, the
    /// item being indexed is cancelled during the first upsert.
    struct FlakyStore {
        inner: Arc<MemoryVectorStore>,
        calls: Arc<AtomicUsize>,
        fail_on: usize,
        cancel_via: Option<Repository>,
    }

    struct FlakyCollection {
        inner: Arc<dyn VectorCollection>,
        calls: Arc<AtomicUsize>,
        fail_on: usize,
        cancel_via: Option<Repository>,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        async fn create_collection(&self, name: &str) -> Result<()> {
            self.inner.create_collection(name).await
        }

        async fn drop_collection(&self, name: &str) -> Result<()> {
            self.inner.drop_collection(name).await
        }

        async fn collection_exists(&self, name: &str) -> Result<bool> {
            self.inner.collection_exists(name).await
        }

        fn collection(&self, name: &str) -> Arc<dyn VectorCollection> {
            Arc::new(FlakyCollection {
                inner: self.inner.collection(name),
                calls: self.calls.clone(),
                fail_on: self.fail_on,
                cancel_via: self.cancel_via.clone(),
            })
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[async_trait]
    impl VectorCollection for FlakyCollection {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn upsert(&self, documents: &[ChunkDocument]) -> Result<usize> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let (1, Some(repo)) = (call, &self.cancel_via) {
                repo.cancel_item(documents[0].metadata.file_id).await?;
            }
            if call == self.fail_on {
                return Err(AppError::EmbeddingError {
                    message: "provider unavailable".into(),
                });
            }
            self.inner.upsert(documents).await
        }

        async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
            self.inner.similarity_search(query, k).await
        }

        async fn delete_by_filter(&self, filter: &MetadataFilter) -> Result<u64> {
            self.inner.delete_by_filter(filter).await
        }
    }

    #[tokio::test]
    async fn test_upstream_failure_rolls_back_earlier_pages() {
        let memory = Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(1024))));
        let flaky = Arc::new(FlakyStore {
            inner: memory.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: 2,
            cancel_via: None,
        });
        let fx = fixture_with(flaky).await;

        let err = fx
            .pipeline
            .ingest(pdf_file(&["Alpha Beta", "Gamma Delta"]), fx.storage.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmbeddingError { .. }));

        let items = fx.repo.list_items(fx.storage.id).await.unwrap();
        assert_eq!(items[0].item_status(), ItemStatus::Failed);
        assert!(memory
            .collection("docs_1")
            .similarity_search("Alpha", 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_item_keeps_no_chunks() {
        let repo = Repository::new(DbPool::in_memory().await.unwrap());
        let memory = Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(1024))));
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: 0,
            cancel_via: Some(repo.clone()),
        });
        memory.create_collection("docs_1").await.unwrap();
        let storage = repo
            .create_storage("Docs".into(), None, "docs_1".into())
            .await
            .unwrap();
        let pipeline =
            IngestionPipeline::new(repo.clone(), store, &IngestionConfig::default()).unwrap();

        let err = pipeline
            .ingest(pdf_file(&["Alpha Beta", "Gamma Delta"]), storage.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));

        let items = repo.list_items(storage.id).await.unwrap();
        assert_eq!(items[0].item_status(), ItemStatus::Cancelled);
        assert_eq!(items[0].chunk_count, 0);
        assert!(memory
            .collection("docs_1")
            .similarity_search("Alpha Gamma", 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_fresh_storage_is_found_despite_replica_lag() {
        let primary = DbPool::in_memory().await.unwrap().primary;
        let replica = DbPool::in_memory().await.unwrap().primary;
        let repo = Repository::new(DbPool {
            primary,
            replica: Some(replica),
        });
        let vectors: Arc<dyn VectorStore> =
            Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(1024))));
        vectors.create_collection("docs_1").await.unwrap();
        let storage = repo
            .create_storage("Docs".into(), None, "docs_1".into())
            .await
            .unwrap();
        let pipeline =
            IngestionPipeline::new(repo.clone(), vectors, &IngestionConfig::default()).unwrap();

        let item_id = pipeline
            .ingest(pdf_file(&["Alpha Beta"]), storage.id)
            .await
            .unwrap();
        assert!(repo.find_item(item_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let fx = fixture().await;
        let item = fx
            .pipeline
            .submit(pdf_file(&["Alpha Beta"]), fx.storage.id)
            .await
            .unwrap();
        assert_eq!(item.item_status(), ItemStatus::Pending);

        let mut status = ItemStatus::Pending;
        for _ in 0..100 {
            status = fx.repo.find_item(item.id).await.unwrap().unwrap().item_status();
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(status, ItemStatus::Success);
    }
}
