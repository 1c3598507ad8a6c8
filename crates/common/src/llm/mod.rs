//! Chat model abstraction
//!
//! Provides a provider-neutral message format with tool calling and the
//! [`ChatModel`] trait implemented by:
//! - OpenAI chat completions (function tools)
//! - A deterministic scripted model for offline runs

mod mock;
mod openai;

pub use mock::MockChatModel;
pub use openai::OpenAIChatModel;

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Author of a message in the model conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message of the model conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Set on tool results, points back at the requesting call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Structured tool output kept for callers, never sent to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Value>,

    /// Marks the rolling summary that replaced older turns
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            artifact: None,
            summary: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        artifact: Option<Value>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            artifact,
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            summary: true,
            ..Self::new(Role::System, content)
        }
    }

    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// Function tool advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// Input of one model call
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
}

/// Chat model with optional tool calling
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce the next assistant message. It either carries text or
    /// requests one or more tool calls.
    async fn complete(&self, request: CompletionRequest) -> Result<Message>;

    fn model_name(&self) -> &str;
}

/// Create a chat model based on configuration
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => match config.api_key.clone().filter(|k| !k.is_empty()) {
            Some(key) => Ok(Arc::new(OpenAIChatModel::new(key, config)?)),
            None => {
                tracing::warn!("No LLM API key configured, using the scripted mock model");
                Ok(Arc::new(MockChatModel::new()))
            }
        },
        "mock" => Ok(Arc::new(MockChatModel::new())),
        other => Err(AppError::Configuration {
            message: format!("unknown LLM provider '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization_skips_empty_parts() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json, json!({"role": "user", "content": "hi"}));

        let summary = serde_json::to_value(Message::summary("earlier")).unwrap();
        assert_eq!(summary["summary"], true);
        assert_eq!(summary["role"], "system");
    }

    #[test]
    fn test_message_state_round_trip() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "retrieve".into(),
            arguments: json!({"query": "alpha"}),
        };
        let messages = vec![
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result("call_1", "Source: a.pdf", Some(json!([{"page": 1}]))),
        ];

        let encoded = serde_json::to_string(&messages).unwrap();
        let decoded: Vec<Message> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, messages);
        assert!(decoded[0].requests_tools());
        assert!(!decoded[1].requests_tools());
    }

    #[test]
    fn test_create_chat_model() {
        let model = create_chat_model(&LlmConfig {
            provider: "mock".into(),
            ..LlmConfig::default()
        })
        .unwrap();
        assert_eq!(model.model_name(), "mock-chat");

        assert!(create_chat_model(&LlmConfig {
            provider: "unknown".into(),
            ..LlmConfig::default()
        })
        .is_err());
    }
}
