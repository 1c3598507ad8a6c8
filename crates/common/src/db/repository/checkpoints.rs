use super::Repository;
use crate::db::models::*;
use crate::errors::Result;
use sea_orm::sea_query::OnConflict;
use sea_orm::{EntityTrait, Set};
use uuid::Uuid;

impl Repository {
    // ========================================================================
    // Agent Checkpoint Operations
    // ========================================================================

    /// Load the persisted agent state of a chat
    pub async fn load_checkpoint(&self, chat_id: Uuid) -> Result<Option<serde_json::Value>> {
        // Always the primary: a stale replica would resume from an older turn
        let checkpoint = CheckpointEntity::find_by_id(chat_id)
            .one(self.write_conn())
            .await?;

        Ok(checkpoint.map(|c| c.state))
    }

    /// Insert or replace the agent state of a chat
    pub async fn save_checkpoint(&self, chat_id: Uuid, state: serde_json::Value) -> Result<()> {
        let checkpoint = CheckpointActiveModel {
            chat_id: Set(chat_id),
            state: Set(state),
            updated_at: Set(chrono::Utc::now().into()),
        };

        CheckpointEntity::insert(checkpoint)
            .on_conflict(
                OnConflict::column(CheckpointColumn::ChatId)
                    .update_columns([CheckpointColumn::State, CheckpointColumn::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(self.write_conn())
            .await?;

        Ok(())
    }

    /// Drop the agent state of a chat
    pub async fn delete_checkpoint(&self, chat_id: Uuid) -> Result<bool> {
        let result = CheckpointEntity::delete_by_id(chat_id)
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_checkpoint_upsert() {
        let repo = repository().await;
        let docs = storage(&repo, "docs").await;
        let chat = repo.create_chat(docs.id, "c".into(), None).await.unwrap();

        assert!(repo.load_checkpoint(chat.id).await.unwrap().is_none());

        repo.save_checkpoint(chat.id, json!({"messages": [1]}))
            .await
            .unwrap();
        repo.save_checkpoint(chat.id, json!({"messages": [1, 2]}))
            .await
            .unwrap();

        let state = repo.load_checkpoint(chat.id).await.unwrap().unwrap();
        assert_eq!(state, json!({"messages": [1, 2]}));

        assert!(repo.delete_checkpoint(chat.id).await.unwrap());
        assert!(repo.load_checkpoint(chat.id).await.unwrap().is_none());
    }
}
