use super::Repository;
use crate::db::models::*;
use crate::errors::Result;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use uuid::Uuid;

impl Repository {
    // ========================================================================
    // Storage Operations
    // ========================================================================

    /// Create a new storage row. The vector collection must already exist.
    pub async fn create_storage(
        &self,
        name: String,
        description: Option<String>,
        collection_name: String,
    ) -> Result<Storage> {
        let now = chrono::Utc::now();

        let storage = StorageActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name),
            description: Set(description),
            collection_name: Set(collection_name),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        storage.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find storage by ID
    pub async fn find_storage(&self, id: Uuid) -> Result<Option<Storage>> {
        StorageEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find storage by ID on the primary, for lookups that must see a
    /// storage created moments ago
    pub async fn find_storage_primary(&self, id: Uuid) -> Result<Option<Storage>> {
        StorageEntity::find_by_id(id)
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    /// All storages, newest first
    pub async fn list_storages(&self) -> Result<Vec<Storage>> {
        StorageEntity::find()
            .order_by_desc(StorageColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Update display fields; the collection name never changes.
    /// `description: Some(None)` clears the description.
    pub async fn update_storage(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<Option<String>>,
    ) -> Result<Option<Storage>> {
        let Some(existing) = self.find_storage(id).await? else {
            return Ok(None);
        };

        let mut storage: StorageActiveModel = existing.into();
        if let Some(name) = name {
            storage.name = Set(name);
        }
        if let Some(description) = description {
            storage.description = Set(description);
        }
        storage.updated_at = Set(chrono::Utc::now().into());

        let updated = storage.update(self.write_conn()).await?;
        Ok(Some(updated))
    }

    /// Delete a storage together with its chats (messages and checkpoints
    /// included) and items, in one transaction. Vectors are not touched here.
    pub async fn delete_storage_cascade(&self, id: Uuid) -> Result<bool> {
        let txn = self.write_conn().begin().await?;

        let chat_ids: Vec<Uuid> = ChatEntity::find()
            .filter(ChatColumn::StorageId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|chat| chat.id)
            .collect();

        if !chat_ids.is_empty() {
            CheckpointEntity::delete_many()
                .filter(CheckpointColumn::ChatId.is_in(chat_ids.clone()))
                .exec(&txn)
                .await?;
            ChatMessageEntity::delete_many()
                .filter(ChatMessageColumn::ChatId.is_in(chat_ids))
                .exec(&txn)
                .await?;
        }

        ChatEntity::delete_many()
            .filter(ChatColumn::StorageId.eq(id))
            .exec(&txn)
            .await?;
        ItemEntity::delete_many()
            .filter(ItemColumn::StorageId.eq(id))
            .exec(&txn)
            .await?;
        let result = StorageEntity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(result.rows_affected > 0)
    }
}
