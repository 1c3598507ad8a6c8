//! Chat orchestration
//!
//! Persists user and assistant turns, threads the agent through each chat's
//! checkpointed state and exposes blocking and streaming responses.
//! Turns on one chat run one at a time; different chats run concurrently.

use crate::agent::Agent;
use crate::state::{AgentState, CheckpointStore, StepEvent};
use cevra_common::db::models::{Chat, ChatMessage, MessageRole};
use cevra_common::db::{ChatSummary, Repository};
use cevra_common::errors::{AppError, Result};
use cevra_common::llm::Message;
use cevra_common::metrics::record_agent_turn;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, instrument, Instrument};
use uuid::Uuid;

/// Chat with its messages in creation order
#[derive(Debug, Clone, Serialize)]
pub struct ChatDetail {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<ChatMessage>,
}

/// Single-consumer stream of agent steps. Dropping it cancels the turn.
pub struct ChatStream {
    rx: mpsc::Receiver<StepEvent>,
}

impl ChatStream {
    pub async fn next(&mut self) -> Option<StepEvent> {
        self.rx.recv().await
    }

    /// Newline-delimited JSON, one object per step
    pub fn into_ndjson(self) -> impl Stream<Item = String> + Send + 'static {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event.to_line(), rx))
        })
    }
}

/// One lock per chat with a turn in flight. Entries die with their last
/// holder and are pruned on the next lookup.
#[derive(Clone, Default)]
struct TurnLocks {
    locks: Arc<Mutex<HashMap<Uuid, Weak<AsyncMutex<()>>>>>,
}

impl TurnLocks {
    async fn acquire(&self, chat_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(&chat_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(chat_id, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    repository: Repository,
    agent: Arc<Agent>,
    checkpoints: Arc<dyn CheckpointStore>,
    turns: TurnLocks,
    stream_buffer: usize,
}

impl ChatOrchestrator {
    pub fn new(
        repository: Repository,
        agent: Arc<Agent>,
        checkpoints: Arc<dyn CheckpointStore>,
        stream_buffer: usize,
    ) -> Self {
        Self {
            repository,
            agent,
            checkpoints,
            turns: TurnLocks::default(),
            stream_buffer: stream_buffer.max(1),
        }
    }

    async fn require_chat(&self, id: Uuid) -> Result<Chat> {
        self.repository
            .find_chat(id)
            .await?
            .ok_or_else(|| AppError::ChatNotFound { id: id.to_string() })
    }

    // ========================================================================
    // Chat CRUD
    // ========================================================================

    pub async fn create_chat(
        &self,
        name: String,
        description: Option<String>,
        storage_id: Uuid,
    ) -> Result<Chat> {
        if self.repository.find_storage(storage_id).await?.is_none() {
            return Err(AppError::StorageNotFound {
                id: storage_id.to_string(),
            });
        }

        let chat = self
            .repository
            .create_chat(storage_id, name, description)
            .await?;
        info!(chat_id = %chat.id, %storage_id, "Chat created");
        Ok(chat)
    }

    pub async fn get_chat(&self, id: Uuid) -> Result<ChatDetail> {
        let chat = self.require_chat(id).await?;
        let messages = self.repository.list_messages(id).await?;
        Ok(ChatDetail { chat, messages })
    }

    /// Newest first, with message count and last message
    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        self.repository.list_chat_summaries().await
    }

    pub async fn update_chat(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<Option<String>>,
    ) -> Result<Chat> {
        self.repository
            .update_chat(id, name, description)
            .await?
            .ok_or_else(|| AppError::ChatNotFound { id: id.to_string() })
    }

    pub async fn delete_chat(&self, id: Uuid) -> Result<()> {
        if !self.repository.delete_chat_cascade(id).await? {
            return Err(AppError::ChatNotFound { id: id.to_string() });
        }
        info!(chat_id = %id, "Chat deleted");
        Ok(())
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Everything that must hold before the model is involved: a usable
    /// query, the chat and its storage. The user turn is persisted here.
    async fn begin_turn(&self, query: &str, chat_id: Uuid) -> Result<(Chat, String)> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::validation("query", "query must not be blank"));
        }

        let chat = self.require_chat(chat_id).await?;
        if self.repository.find_storage(chat.storage_id).await?.is_none() {
            return Err(AppError::StorageNotFound {
                id: chat.storage_id.to_string(),
            });
        }

        self.repository
            .append_message(chat.id, MessageRole::User, query)
            .await?;
        Ok((chat, query.to_string()))
    }

    async fn load_state(&self, chat_id: Uuid) -> Result<AgentState> {
        Ok(self.checkpoints.load(chat_id).await?.unwrap_or_default())
    }

    /// Checkpoint first, then the visible assistant message
    async fn complete_turn(
        &self,
        chat: &Chat,
        state: &AgentState,
        reply: &Message,
    ) -> Result<ChatMessage> {
        self.checkpoints.save(chat.id, state).await?;
        self.repository
            .append_message(chat.id, MessageRole::Assistant, &reply.content)
            .await
    }

    /// Answer and wait for the full reply
    #[instrument(skip(self, query), fields(%chat_id))]
    pub async fn respond(&self, query: &str, chat_id: Uuid) -> Result<ChatMessage> {
        let _turn = self.turns.acquire(chat_id).await;
        let (chat, query) = self.begin_turn(query, chat_id).await?;

        let start = Instant::now();
        let result = async {
            let mut state = self.load_state(chat.id).await?;
            let reply = self
                .agent
                .run(&mut state, &query, chat.storage_id, None)
                .await?;
            self.complete_turn(&chat, &state, &reply).await
        }
        .await;

        record_agent_turn(
            start.elapsed().as_secs_f64(),
            "respond",
            if result.is_ok() { "success" } else { "error" },
        );
        result
    }

    /// Start a streamed answer. Missing chats fail here, before any event.
    /// The turn runs in a background task. Dropping the returned stream
    /// stops the agent; once the final reply exists it is persisted even
    /// if the client is already gone.
    #[instrument(skip(self, query), fields(%chat_id))]
    pub async fn stream(&self, query: &str, chat_id: Uuid) -> Result<ChatStream> {
        let turn = self.turns.acquire(chat_id).await;
        let (chat, query) = self.begin_turn(query, chat_id).await?;
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        let this = self.clone();
        let span = tracing::info_span!("chat_stream", %chat_id);
        tokio::spawn(
            async move {
                let _turn = turn;
                let start = Instant::now();

                let outcome = match this.load_state(chat.id).await {
                    Ok(mut state) => {
                        let reply = {
                            let run = this
                                .agent
                                .run(&mut state, &query, chat.storage_id, Some(&tx));
                            tokio::select! {
                                biased;
                                result = run => result,
                                _ = tx.closed() => Err(AppError::Cancelled),
                            }
                        };
                        match reply {
                            Ok(reply) => this.complete_turn(&chat, &state, &reply).await,
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };

                let status = match outcome {
                    Ok(_) => "success",
                    Err(AppError::Cancelled) => {
                        info!("Client went away, turn cancelled");
                        "cancelled"
                    }
                    Err(err) => {
                        error!(error = %err, "Streamed turn failed");
                        let _ = tx.send(StepEvent::error(err.public_message())).await;
                        "error"
                    }
                };
                record_agent_turn(start.elapsed().as_secs_f64(), "stream", status);
            }
            .instrument(span),
        );

        Ok(ChatStream { rx })
    }
}
