//! Storage catalog
//!
//! Storages own a vector collection each; items are the files ingested
//! into them. Creating a storage creates its collection, deleting it
//! removes chats, items and the collection.

use cevra_common::db::models::{Item, Storage};
use cevra_common::db::{Repository, StatusCounts};
use cevra_common::errors::{AppError, Result};
use cevra_common::vector::{MetadataFilter, VectorStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Longest name prefix kept in a collection name
const COLLECTION_PREFIX_LEN: usize = 40;

/// Storage with per-status item counts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageView {
    #[serde(flatten)]
    pub storage: Storage,
    pub item_counts: StatusCounts,
}

/// Items of one storage with their status breakdown
#[derive(Debug, Clone, Serialize)]
pub struct ItemListing {
    pub items: Vec<Item>,
    pub counts: StatusCounts,
}

/// Collection names are derived once from the display name plus a random
/// suffix, so two storages never share vectors even with equal names
pub fn collection_name_for(name: &str) -> String {
    let mut prefix: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(COLLECTION_PREFIX_LEN)
        .collect();
    if prefix.trim_matches('_').is_empty() {
        prefix = "storage".to_string();
    }

    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct StorageCatalog {
    repository: Repository,
    vectors: Arc<dyn VectorStore>,
}

impl StorageCatalog {
    pub fn new(repository: Repository, vectors: Arc<dyn VectorStore>) -> Self {
        Self {
            repository,
            vectors,
        }
    }

    async fn require_storage(&self, id: Uuid) -> Result<Storage> {
        self.repository
            .find_storage(id)
            .await?
            .ok_or_else(|| AppError::StorageNotFound { id: id.to_string() })
    }

    #[instrument(skip(self, description))]
    pub async fn create_storage(
        &self,
        name: String,
        description: Option<String>,
    ) -> Result<Storage> {
        if name.trim().is_empty() {
            return Err(AppError::validation("name", "name must not be blank"));
        }

        let collection = collection_name_for(&name);
        self.vectors.create_collection(&collection).await?;

        match self
            .repository
            .create_storage(name, description, collection.clone())
            .await
        {
            Ok(storage) => {
                info!(storage_id = %storage.id, collection = %collection, "Storage created");
                Ok(storage)
            }
            Err(err) => {
                if let Err(drop_err) = self.vectors.drop_collection(&collection).await {
                    warn!(collection = %collection, error = %drop_err, "Orphaned collection");
                }
                Err(err)
            }
        }
    }

    pub async fn get_storage(&self, id: Uuid) -> Result<StorageView> {
        let storage = self.require_storage(id).await?;
        let counts = self.repository.item_status_counts(Some(id)).await?;

        Ok(StorageView {
            item_counts: counts.get(&id).copied().unwrap_or_default(),
            storage,
        })
    }

    /// Newest first
    pub async fn list_storages(&self) -> Result<Vec<StorageView>> {
        let storages = self.repository.list_storages().await?;
        let counts = self.repository.item_status_counts(None).await?;

        Ok(storages
            .into_iter()
            .map(|storage| StorageView {
                item_counts: counts.get(&storage.id).copied().unwrap_or_default(),
                storage,
            })
            .collect())
    }

    pub async fn update_storage(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<Option<String>>,
    ) -> Result<Storage> {
        if name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(AppError::validation("name", "name must not be blank"));
        }

        self.repository
            .update_storage(id, name, description)
            .await?
            .ok_or_else(|| AppError::StorageNotFound { id: id.to_string() })
    }

    #[instrument(skip(self))]
    pub async fn delete_storage(&self, id: Uuid) -> Result<()> {
        let storage = self.require_storage(id).await?;

        if !self.repository.delete_storage_cascade(id).await? {
            return Err(AppError::StorageNotFound { id: id.to_string() });
        }
        self.vectors.drop_collection(&storage.collection_name).await?;

        info!(storage_id = %id, "Storage deleted");
        Ok(())
    }

    pub async fn list_items(&self, storage_id: Uuid) -> Result<ItemListing> {
        self.require_storage(storage_id).await?;

        let items = self.repository.list_items(storage_id).await?;
        let counts = self
            .repository
            .item_status_counts(Some(storage_id))
            .await?
            .remove(&storage_id)
            .unwrap_or_default();

        Ok(ItemListing { items, counts })
    }

    pub async fn get_item(&self, storage_id: Uuid, item_id: Uuid) -> Result<Item> {
        self.require_storage(storage_id).await?;

        self.repository
            .find_storage_item(storage_id, item_id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound {
                id: item_id.to_string(),
            })
    }

    /// A pending item is cancelled first, so an ingestion still running for
    /// it discards its chunks instead of completing. Vectors go before the
    /// row so a failure never leaves chunks without an item.
    #[instrument(skip(self))]
    pub async fn delete_item(&self, storage_id: Uuid, item_id: Uuid) -> Result<()> {
        let storage = self.require_storage(storage_id).await?;
        let item = self.get_item(storage_id, item_id).await?;

        if !item.is_terminal() {
            match self.repository.cancel_item(item.id).await {
                Ok(_) => info!(item_id = %item.id, "Pending item cancelled"),
                Err(AppError::Conflict { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let removed = self
            .vectors
            .collection(&storage.collection_name)
            .delete_by_filter(&MetadataFilter::for_item(storage.id, item.id))
            .await?;
        self.repository.delete_item(item.id).await?;

        info!(item_id = %item.id, removed, "Item deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::sample_pdf;
    use crate::pipeline::{IngestionPipeline, UploadedFile};
    use bytes::Bytes;
    use cevra_common::config::IngestionConfig;
    use cevra_common::db::DbPool;
    use cevra_common::embeddings::MockEmbedder;
    use async_trait::async_trait;
    use cevra_common::vector::{
        ChunkDocument, MemoryVectorStore, ScoredChunk, VectorCollection,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;

    async fn setup() -> (StorageCatalog, IngestionPipeline, Arc<dyn VectorStore>) {
        let repo = Repository::new(DbPool::in_memory().await.unwrap());
        let vectors: Arc<dyn VectorStore> =
            Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(512))));
        let pipeline =
            IngestionPipeline::new(repo.clone(), vectors.clone(), &IngestionConfig::default())
                .unwrap();
        (StorageCatalog::new(repo, vectors.clone()), pipeline, vectors)
    }

    fn pdf(text: &str) -> UploadedFile {
        UploadedFile::new("a.pdf", "application/pdf", Bytes::from(sample_pdf(&[text])))
    }

    #[test]
    fn test_collection_names_are_unique_and_safe() {
        let a = collection_name_for("My Docs!");
        let b = collection_name_for("My Docs!");
        assert_ne!(a, b);
        assert!(a.starts_with("my_docs__"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(collection_name_for("???").starts_with("storage_"));
    }

    #[tokio::test]
    async fn test_storage_lifecycle() {
        let (catalog, pipeline, vectors) = setup().await;

        let storage = catalog
            .create_storage("Docs".into(), Some("manuals".into()))
            .await
            .unwrap();
        assert!(vectors.collection_exists(&storage.collection_name).await.unwrap());

        pipeline.ingest(pdf("Alpha"), storage.id).await.unwrap();
        let bad = UploadedFile::new("b.pdf", "application/pdf", Bytes::from_static(b"x"));
        assert!(pipeline.ingest(bad, storage.id).await.is_err());

        let view = catalog.get_storage(storage.id).await.unwrap();
        assert_eq!(view.item_counts.completed, 1);
        assert_eq!(view.item_counts.failed, 1);
        assert_eq!(view.item_counts.total, 2);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["name"], "Docs");
        assert_eq!(json["itemCounts"]["completed"], 1);

        let renamed = catalog
            .update_storage(storage.id, Some("Manuals".into()), None)
            .await
            .unwrap();
        assert_eq!(renamed.collection_name, storage.collection_name);

        catalog.delete_storage(storage.id).await.unwrap();
        assert!(!vectors.collection_exists(&storage.collection_name).await.unwrap());
        assert!(matches!(
            catalog.get_storage(storage.id).await,
            Err(AppError::StorageNotFound { .. })
        ));
        assert!(catalog.delete_storage(storage.id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_storages_with_counts() {
        let (catalog, pipeline, _) = setup().await;
        let first = catalog.create_storage("first".into(), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = catalog.create_storage("second".into(), None).await.unwrap();
        pipeline.ingest(pdf("Beta"), second.id).await.unwrap();

        let listed = catalog.list_storages().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].storage.id, second.id);
        assert_eq!(listed[0].item_counts.completed, 1);
        assert_eq!(listed[1].storage.id, first.id);
        assert_eq!(listed[1].item_counts, StatusCounts::default());
    }

    #[tokio::test]
    async fn test_delete_item_purges_vectors() {
        let (catalog, pipeline, vectors) = setup().await;
        let storage = catalog.create_storage("Docs".into(), None).await.unwrap();
        let item_id = pipeline.ingest(pdf("Alpha Beta"), storage.id).await.unwrap();

        let listing = catalog.list_items(storage.id).await.unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.counts.completed, 1);

        catalog.delete_item(storage.id, item_id).await.unwrap();
        assert!(vectors
            .collection(&storage.collection_name)
            .similarity_search("Alpha", 5)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            catalog.get_item(storage.id, item_id).await,
            Err(AppError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_blank_name_is_rejected() {
        let (catalog, _, _) = setup().await;
        assert!(matches!(
            catalog.create_storage("   ".into(), None).await,
            Err(AppError::Validation { .. })
        ));
    }

    /// Deletes the item being indexed from inside its first upsert
    struct DeletingStore {
        inner: Arc<MemoryVectorStore>,
        catalog: OnceLock<StorageCatalog>,
        fired: Arc<AtomicBool>,
    }

    struct DeletingCollection {
        inner: Arc<dyn VectorCollection>,
        catalog: StorageCatalog,
        fired: Arc<AtomicBool>,
    }

    #[async_trait]
    impl VectorStore for DeletingStore {
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
            Arc::new(DeletingCollection {
                inner: self.inner.collection(name),
                catalog: self.catalog.get().cloned().unwrap(),
                fired: self.fired.clone(),
            })
        }

        fn backend_name(&self) -> &'static str {
            "deleting"
        }
    }

    #[async_trait]
    impl VectorCollection for DeletingCollection {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn upsert(&self, documents: &[ChunkDocument]) -> Result<usize> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let metadata = &documents[0].metadata;
                self.catalog
                    .delete_item(metadata.storage_id, metadata.file_id)
                    .await?;
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
    async fn test_item_deleted_during_ingestion_leaves_no_chunks() {
        let repo = Repository::new(DbPool::in_memory().await.unwrap());
        let memory = Arc::new(MemoryVectorStore::new(Arc::new(MockEmbedder::new(512))));
        let catalog = StorageCatalog::new(repo.clone(), memory.clone());
        let store = Arc::new(DeletingStore {
            inner: memory.clone(),
            catalog: OnceLock::new(),
            fired: Arc::new(AtomicBool::new(false)),
        });
        let _ = store.catalog.set(catalog.clone());
        let pipeline =
            IngestionPipeline::new(repo.clone(), store, &IngestionConfig::default()).unwrap();

        let storage = catalog.create_storage("Docs".into(), None).await.unwrap();
        let file = UploadedFile::new(
            "a.pdf",
            "application/pdf",
            Bytes::from(sample_pdf(&["Alpha Beta", "Gamma Delta"])),
        );

        let err = pipeline.ingest(file, storage.id).await.unwrap_err();
        assert!(matches!(err, AppError::ItemNotFound { .. }));

        assert!(repo.list_items(storage.id).await.unwrap().is_empty());
        for query in ["Alpha", "Gamma"] {
            assert!(memory
                .collection(&storage.collection_name)
                .similarity_search(query, 5)
                .await
                .unwrap()
                .is_empty());
        }
    }
}
