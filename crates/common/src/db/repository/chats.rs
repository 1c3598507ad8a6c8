use super::Repository;
use crate::db::models::*;
use crate::errors::Result;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Preview of the most recent message of a chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub role: String,
    pub content: String,
}

/// Chat enriched with its storage name and message statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub storage_name: Option<String>,
    pub message_count: i64,
    pub last_message: Option<LastMessage>,
}

impl Repository {
    // ========================================================================
    // Chat Operations
    // ========================================================================

    /// Create a chat bound to a storage
    pub async fn create_chat(
        &self,
        storage_id: Uuid,
        name: String,
        description: Option<String>,
    ) -> Result<Chat> {
        let now = chrono::Utc::now();

        let chat = ChatActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name),
            description: Set(description),
            storage_id: Set(storage_id),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        chat.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find chat by ID
    pub async fn find_chat(&self, id: Uuid) -> Result<Option<Chat>> {
        ChatEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Update display fields. `description: Some(None)` clears it.
    pub async fn update_chat(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<Option<String>>,
    ) -> Result<Option<Chat>> {
        let Some(existing) = self.find_chat(id).await? else {
            return Ok(None);
        };

        let mut chat: ChatActiveModel = existing.into();
        if let Some(name) = name {
            chat.name = Set(name);
        }
        if let Some(description) = description {
            chat.description = Set(description);
        }
        chat.updated_at = Set(chrono::Utc::now().into());

        let updated = chat.update(self.write_conn()).await?;
        Ok(Some(updated))
    }

    /// Delete a chat with its messages and checkpoint in one transaction
    pub async fn delete_chat_cascade(&self, id: Uuid) -> Result<bool> {
        let txn = self.write_conn().begin().await?;

        CheckpointEntity::delete_by_id(id).exec(&txn).await?;
        ChatMessageEntity::delete_many()
            .filter(ChatMessageColumn::ChatId.eq(id))
            .exec(&txn)
            .await?;
        let result = ChatEntity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(result.rows_affected > 0)
    }

    /// All chats, newest first, with storage name, message count and last
    /// message preview
    pub async fn list_chat_summaries(&self) -> Result<Vec<ChatSummary>> {
        let chats = ChatEntity::find()
            .find_also_related(StorageEntity)
            .order_by_desc(ChatColumn::CreatedAt)
            .all(self.read_conn())
            .await?;

        let counts = self.message_counts().await?;
        let mut last_messages = self.last_messages().await?;

        Ok(chats
            .into_iter()
            .map(|(chat, storage)| ChatSummary {
                message_count: counts.get(&chat.id).copied().unwrap_or(0),
                storage_name: storage.map(|s| s.name),
                last_message: last_messages.remove(&chat.id).map(|m| LastMessage {
                    role: m.role,
                    content: m.content,
                }),
                chat,
            })
            .collect())
    }

    // ========================================================================
    // Chat Message Operations
    // ========================================================================

    /// Append a message; messages are never edited afterwards
    pub async fn append_message(
        &self,
        chat_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<ChatMessage> {
        let message = ChatMessageActiveModel {
            id: Set(Uuid::now_v7()),
            chat_id: Set(chat_id),
            role: Set(role.as_str().to_string()),
            content: Set(content.to_string()),
            created_at: Set(chrono::Utc::now().into()),
        };

        message.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Messages of a chat in creation order
    pub async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        ChatMessageEntity::find()
            .filter(ChatMessageColumn::ChatId.eq(chat_id))
            .order_by_asc(ChatMessageColumn::CreatedAt)
            .order_by_asc(ChatMessageColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Most recent message of a chat
    pub async fn last_message(&self, chat_id: Uuid) -> Result<Option<ChatMessage>> {
        ChatMessageEntity::find()
            .filter(ChatMessageColumn::ChatId.eq(chat_id))
            .order_by_desc(ChatMessageColumn::CreatedAt)
            .order_by_desc(ChatMessageColumn::Id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Most recent message of every chat that has one, in a single query.
    /// Rows sharing the latest timestamp are resolved by id, like
    /// [`Repository::last_message`].
    pub async fn last_messages(&self) -> Result<HashMap<Uuid, ChatMessage>> {
        let rows = ChatMessageEntity::find()
            .filter(Expr::cust(
                "chat_messages.created_at = (SELECT MAX(latest.created_at) \
                 FROM chat_messages AS latest WHERE latest.chat_id = chat_messages.chat_id)",
            ))
            .order_by_asc(ChatMessageColumn::Id)
            .all(self.read_conn())
            .await?;

        Ok(rows.into_iter().map(|m| (m.chat_id, m)).collect())
    }

    /// Message count per chat
    pub async fn message_counts(&self) -> Result<HashMap<Uuid, i64>> {
        let rows: Vec<(Uuid, i64)> = ChatMessageEntity::find()
            .select_only()
            .column(ChatMessageColumn::ChatId)
            .column_as(Expr::col(ChatMessageColumn::Id).count(), "count")
            .group_by(ChatMessageColumn::ChatId)
            .into_tuple()
            .all(self.read_conn())
            .await?;

        Ok(rows.into_iter().collect())
    }
}
