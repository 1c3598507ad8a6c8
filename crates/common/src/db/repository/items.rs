use super::Repository;
use crate::db::models::*;
use crate::errors::{AppError, Result};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-status item counts for one storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl StatusCounts {
    fn add(&mut self, status: ItemStatus, count: i64) {
        match status {
            ItemStatus::Pending => self.in_progress += count,
            ItemStatus::Success => self.completed += count,
            ItemStatus::Failed => self.failed += count,
            ItemStatus::Cancelled => self.cancelled += count,
        }
        self.total += count;
    }
}

impl Repository {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Record a freshly uploaded file in `pending` state
    pub async fn create_item(
        &self,
        storage_id: Uuid,
        name: String,
        mime_type: String,
        size: u64,
    ) -> Result<Item> {
        let item = ItemActiveModel {
            id: Set(Uuid::new_v4()),
            storage_id: Set(storage_id),
            name: Set(name),
            mime_type: Set(mime_type),
            size: Set(i64::try_from(size).unwrap_or(i64::MAX)),
            status: Set(ItemStatus::Pending.into()),
            chunk_count: Set(0),
            error_message: Set(None),
            uploaded_at: Set(chrono::Utc::now().into()),
            completed_at: Set(None),
        };

        item.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find item by ID
    pub async fn find_item(&self, id: Uuid) -> Result<Option<Item>> {
        ItemEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find an item only if it belongs to the given storage
    pub async fn find_storage_item(&self, storage_id: Uuid, id: Uuid) -> Result<Option<Item>> {
        ItemEntity::find_by_id(id)
            .filter(ItemColumn::StorageId.eq(storage_id))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Items of one storage, most recent upload first
    pub async fn list_items(&self, storage_id: Uuid) -> Result<Vec<Item>> {
        ItemEntity::find()
            .filter(ItemColumn::StorageId.eq(storage_id))
            .order_by_desc(ItemColumn::UploadedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Mark an item as successfully indexed
    pub async fn complete_item(&self, id: Uuid, chunk_count: usize) -> Result<Item> {
        self.finish_item(id, ItemStatus::Success, chunk_count, None)
            .await
    }

    /// Mark an item as failed, keeping the reason
    pub async fn fail_item(&self, id: Uuid, error: &str) -> Result<Item> {
        self.finish_item(id, ItemStatus::Failed, 0, Some(error.to_string()))
            .await
    }

    /// Mark an item as cancelled
    pub async fn cancel_item(&self, id: Uuid) -> Result<Item> {
        self.finish_item(id, ItemStatus::Cancelled, 0, None).await
    }

    /// Single conditional update so a terminal status is written at most once
    /// even when two writers race.
    async fn finish_item(
        &self,
        id: Uuid,
        status: ItemStatus,
        chunk_count: usize,
        error_message: Option<String>,
    ) -> Result<Item> {
        let now: DateTimeWithTimeZone = chrono::Utc::now().into();

        let result = ItemEntity::update_many()
            .col_expr(ItemColumn::Status, Expr::value(status.as_str()))
            .col_expr(
                ItemColumn::ChunkCount,
                Expr::value(i32::try_from(chunk_count).unwrap_or(i32::MAX)),
            )
            .col_expr(ItemColumn::ErrorMessage, Expr::value(error_message))
            .col_expr(ItemColumn::CompletedAt, Expr::value(Some(now)))
            .filter(ItemColumn::Id.eq(id))
            .filter(ItemColumn::Status.eq(ItemStatus::Pending.as_str()))
            .exec(self.write_conn())
            .await?;

        // Read back from the primary; a lagging replica may not have the update
        let item = ItemEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::ItemNotFound { id: id.to_string() })?;

        if result.rows_affected == 0 {
            return Err(AppError::Conflict {
                message: format!(
                    "item {} is already {}, cannot move to {}",
                    id,
                    item.status,
                    status.as_str()
                ),
            });
        }

        Ok(item)
    }

    /// Delete item by ID
    pub async fn delete_item(&self, id: Uuid) -> Result<bool> {
        let result = ItemEntity::delete_by_id(id).exec(self.write_conn()).await?;

        Ok(result.rows_affected > 0)
    }

    /// Items grouped by status, keyed by storage. Restrict to one storage
    /// with `storage_id`.
    pub async fn item_status_counts(
        &self,
        storage_id: Option<Uuid>,
    ) -> Result<HashMap<Uuid, StatusCounts>> {
        let mut query = ItemEntity::find()
            .select_only()
            .column(ItemColumn::StorageId)
            .column(ItemColumn::Status)
            .column_as(Expr::col(ItemColumn::Id).count(), "count")
            .group_by(ItemColumn::StorageId)
            .group_by(ItemColumn::Status);

        if let Some(storage_id) = storage_id {
            query = query.filter(ItemColumn::StorageId.eq(storage_id));
        }

        let rows: Vec<(Uuid, String, i64)> = query.into_tuple().all(self.read_conn()).await?;

        let mut counts: HashMap<Uuid, StatusCounts> = HashMap::new();
        for (storage_id, status, count) in rows {
            let status = status.parse().unwrap_or(ItemStatus::Failed);
            counts.entry(storage_id).or_default().add(status, count);
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_item_lifecycle() {
        let repo = repository().await;
        let docs = storage(&repo, "docs").await;

        let item = repo
            .create_item(docs.id, "manual.pdf".into(), "application/pdf".into(), 2048)
            .await
            .unwrap();
        assert_eq!(item.item_status(), ItemStatus::Pending);
        assert_eq!(item.size, 2048);
        assert!(!item.is_terminal());

        let done = repo.complete_item(item.id, 7).await.unwrap();
        assert_eq!(done.item_status(), ItemStatus::Success);
        assert_eq!(done.chunk_count, 7);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_written_once() {
        let repo = repository().await;
        let docs = storage(&repo, "docs").await;
        let item = repo
            .create_item(docs.id, "a.pdf".into(), "application/pdf".into(), 1)
            .await
            .unwrap();

        let failed = repo.fail_item(item.id, "broken xref").await.unwrap();
        assert_eq!(failed.item_status(), ItemStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("broken xref"));

        let err = repo.complete_item(item.id, 3).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));

        let current = repo.find_item(item.id).await.unwrap().unwrap();
        assert_eq!(current.item_status(), ItemStatus::Failed);
    }

    #[tokio::test]
    async fn test_finish_missing_item() {
        let repo = repository().await;
        let err = repo.cancel_item(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::ItemNotFound { .. }));
    }

    #[tokio::test]
    async fn test_finish_reads_back_from_primary() {
        let repo = lagging_repository().await;
        let docs = storage(&repo, "docs").await;
        let item = repo
            .create_item(docs.id, "a.pdf".into(), "application/pdf".into(), 1)
            .await
            .unwrap();
        assert!(repo.find_item(item.id).await.unwrap().is_none());

        let done = repo.complete_item(item.id, 4).await.unwrap();
        assert_eq!(done.item_status(), ItemStatus::Success);
        assert_eq!(done.chunk_count, 4);

        let err = repo.cancel_item(item.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_item_is_scoped_to_storage() {
        let repo = repository().await;
        let docs = storage(&repo, "docs").await;
        let other = storage(&repo, "other").await;
        let item = repo
            .create_item(docs.id, "a.pdf".into(), "application/pdf".into(), 1)
            .await
            .unwrap();

        assert!(repo.find_storage_item(docs.id, item.id).await.unwrap().is_some());
        assert!(repo.find_storage_item(other.id, item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_counts_per_storage() {
        let repo = repository().await;
        let docs = storage(&repo, "docs").await;
        let other = storage(&repo, "other").await;

        let mut ids = Vec::new();
        for name in ["a.pdf", "b.pdf", "c.pdf", "d.pdf"] {
            let item = repo
                .create_item(docs.id, name.into(), "application/pdf".into(), 1)
                .await
                .unwrap();
            ids.push(item.id);
        }
        repo.complete_item(ids[0], 1).await.unwrap();
        repo.complete_item(ids[1], 1).await.unwrap();
        repo.fail_item(ids[2], "boom").await.unwrap();
        repo.create_item(other.id, "z.pdf".into(), "application/pdf".into(), 1)
            .await
            .unwrap();

        let all = repo.item_status_counts(None).await.unwrap();
        let docs_counts = all[&docs.id];
        assert_eq!(
            docs_counts,
            StatusCounts {
                in_progress: 1,
                completed: 2,
                failed: 1,
                cancelled: 0,
                total: 4,
            }
        );
        assert_eq!(all[&other.id].in_progress, 1);

        let scoped = repo.item_status_counts(Some(other.id)).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[&other.id].total, 1);
    }
}
