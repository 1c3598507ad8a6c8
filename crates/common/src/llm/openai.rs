//! OpenAI chat completions with function tools

use super::{ChatModel, CompletionRequest, Message, Role, ToolCall, ToolSpec};
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::metrics::record_llm;
use crate::upstream;
use async_trait::async_trait;
use backoff::future::retry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

pub struct OpenAIChatModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    retry_budget: Duration,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object
    arguments: String,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionSpec<'a>,
}

#[derive(Serialize)]
struct WireFunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

fn function_kind() -> String {
    "function".to_string()
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire(message: &Message) -> WireMessage {
    let tool_calls = (!message.tool_calls.is_empty()).then(|| {
        message
            .tool_calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: function_kind(),
                function: WireFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect()
    });

    // Assistant turns that only call tools carry a null content
    let content = if tool_calls.is_some() && message.content.is_empty() {
        None
    } else {
        Some(message.content.clone())
    };

    WireMessage {
        role: role_name(message.role).to_string(),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn from_wire(message: WireMessage) -> Message {
    let calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments)),
            id: call.id,
            name: call.function.name,
        })
        .collect();

    Message::assistant_with_tool_calls(message.content.unwrap_or_default(), calls)
}

fn to_wire_tool(spec: &ToolSpec) -> WireTool<'_> {
    WireTool {
        kind: "function",
        function: WireFunctionSpec {
            name: &spec.name,
            description: &spec.description,
            parameters: &spec.parameters,
        },
    }
}

impl OpenAIChatModel {
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            retry_budget: Duration::from_secs(config.retry_budget_secs),
        })
    }

    async fn make_request(
        &self,
        body: &WireRequest<'_>,
    ) -> std::result::Result<Message, backoff::Error<AppError>> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let transient = upstream::is_transient_transport(&e);
                upstream::classify(
                    AppError::LlmError {
                        message: format!("Request failed: {}", e),
                    },
                    transient,
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream::classify(
                AppError::LlmError {
                    message: format!("API error {}: {}", status, body),
                },
                upstream::is_transient_status(status),
            ));
        }

        let result: WireResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(AppError::LlmError {
                message: format!("Failed to parse response: {}", e),
            })
        })?;

        result
            .choices
            .into_iter()
            .next()
            .map(|choice| from_wire(choice.message))
            .ok_or_else(|| {
                backoff::Error::permanent(AppError::LlmError {
                    message: "Response contained no choices".to_string(),
                })
            })
    }
}

#[async_trait]
impl ChatModel for OpenAIChatModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Message> {
        let body = WireRequest {
            model: &self.model,
            messages: request.messages.iter().map(to_wire).collect(),
            tools: request.tools.iter().map(to_wire_tool).collect(),
            temperature: request.temperature,
        };

        let start = Instant::now();
        let result = retry(upstream::retry_policy(self.retry_budget), || async {
            self.make_request(&body).await
        })
        .await;

        record_llm(start.elapsed().as_secs_f64(), &self.model, result.is_ok());
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
