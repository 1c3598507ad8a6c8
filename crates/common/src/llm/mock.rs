//! Scripted chat model for offline runs
//!
//! Behaves like a retrieval-first assistant: a fresh question triggers a
//! call to the first offered tool, tool output is turned into an answer,
//! and tool-less requests (such as summarization) get a condensed echo.

use super::{ChatModel, CompletionRequest, Message, Role, ToolCall};
use crate::errors::Result;
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

const EXCERPT_CHARS: usize = 280;

#[derive(Debug, Default, Clone)]
pub struct MockChatModel;

impl MockChatModel {
    pub fn new() -> Self {
        Self
    }
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(EXCERPT_CHARS).collect();
    if text.chars().count() > EXCERPT_CHARS {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Message> {
        let Some(last) = request.messages.last() else {
            return Ok(Message::assistant("How can I help?"));
        };

        let reply = match last.role {
            Role::Tool => {
                // Answer from every tool result of the current round
                let context: Vec<&str> = request
                    .messages
                    .iter()
                    .rev()
                    .take_while(|m| m.role == Role::Tool)
                    .map(|m| m.content.as_str())
                    .collect();
                let context = context.into_iter().rev().collect::<Vec<_>>().join("\n");
                Message::assistant(format!(
                    "Based on the documents: {}",
                    excerpt(context.trim())
                ))
            }
            Role::User => match request.tools.first() {
                Some(tool) => Message::assistant_with_tool_calls(
                    "",
                    vec![ToolCall {
                        id: format!("call_{}", Uuid::new_v4().simple()),
                        name: tool.name.clone(),
                        arguments: json!({ "query": last.content }),
                    }],
                ),
                None => Message::assistant(excerpt(last.content.trim())),
            },
            Role::System | Role::Assistant => Message::assistant(excerpt(last.content.trim())),
        };

        Ok(reply)
    }

    fn model_name(&self) -> &str {
        "mock-chat"
    }
}
