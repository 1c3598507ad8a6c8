//! Conversation state, step events and checkpoint persistence

use async_trait::async_trait;
use cevra_common::db::Repository;
use cevra_common::errors::Result;
use cevra_common::llm::{Message, Role};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Persisted agent state of one chat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl AgentState {
    pub fn summary(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.summary)
    }
}

/// Kind of a streamed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Human,
    Ai,
    Tool,
    System,
    Error,
}

/// One agent step as seen by a streaming client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub content: String,
}

impl StepEvent {
    pub fn from_message(message: &Message) -> Self {
        let kind = match message.role {
            Role::User => StepKind::Human,
            Role::Assistant => StepKind::Ai,
            Role::Tool => StepKind::Tool,
            Role::System => StepKind::System,
        };

        Self {
            kind,
            content: message.content.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Error,
            content: message.into(),
        }
    }

    /// Newline-terminated JSON object
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","content":"unserializable event"}"#.to_string()
        });
        line.push('\n');
        line
    }
}

/// Where agent state lives between turns
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, chat_id: Uuid) -> Result<Option<AgentState>>;

    async fn save(&self, chat_id: Uuid, state: &AgentState) -> Result<()>;
}

#[async_trait]
impl CheckpointStore for Repository {
    async fn load(&self, chat_id: Uuid) -> Result<Option<AgentState>> {
        let Some(raw) = self.load_checkpoint(chat_id).await? else {
            return Ok(None);
        };

        match serde_json::from_value(raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // The chat continues without its earlier context
                warn!(%chat_id, error = %e, "Discarding unreadable checkpoint");
                Ok(None)
            }
        }
    }

    async fn save(&self, chat_id: Uuid, state: &AgentState) -> Result<()> {
        self.save_checkpoint(chat_id, serde_json::to_value(state)?)
            .await
    }
}
