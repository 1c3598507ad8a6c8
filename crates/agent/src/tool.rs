//! Retrieval tool exposed to the model

use crate::prompt::NO_RESULTS;
use cevra_common::errors::Result;
use cevra_common::llm::{Message, ToolCall, ToolSpec};
use cevra_common::metrics::record_tool_call;
use cevra_search::{Retriever, SearchHit};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const RETRIEVE_TOOL: &str = "retrieve";

/// Result of one retrieval: the text handed to the model plus the raw
/// passages kept for citations
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub summary: String,
    pub passages: Vec<SearchHit>,
}

pub struct RetrieveTool {
    retriever: Arc<dyn Retriever>,
    k: usize,
}

impl RetrieveTool {
    pub fn new(retriever: Arc<dyn Retriever>, k: usize) -> Self {
        Self {
            retriever,
            k: k.max(1),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: RETRIEVE_TOOL.to_string(),
            description: "Retrieve passages related to a query from the documents of the \
                          current storage."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What to look up in the documents"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    pub async fn retrieve(&self, query: &str, storage_id: Uuid) -> Result<ToolOutput> {
        let passages = self.retriever.retrieve(query, storage_id, self.k).await?;
        debug!(passages = passages.len(), "Retrieval tool finished");

        Ok(ToolOutput {
            summary: format_passages(&passages),
            passages,
        })
    }

    /// Execute a model tool call and wrap the outcome as a tool message.
    /// Malformed calls are answered in-band so the model can recover.
    pub async fn invoke(&self, call: &ToolCall, storage_id: Uuid) -> Result<Message> {
        if call.name != RETRIEVE_TOOL {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return Ok(Message::tool_result(
                &call.id,
                format!("Unknown tool '{}'.", call.name),
                None,
            ));
        }

        let query = call
            .arguments
            .get("query")
            .and_then(|q| q.as_str())
            .or_else(|| call.arguments.as_str())
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(Message::tool_result(
                &call.id,
                "The retrieve tool needs a non-empty 'query' argument.",
                None,
            ));
        }

        record_tool_call(RETRIEVE_TOOL);
        let output = self.retrieve(query, storage_id).await?;
        Ok(Message::tool_result(
            &call.id,
            output.summary,
            Some(serde_json::to_value(&output.passages)?),
        ))
    }
}

/// One "Source/Content" block per passage
pub fn format_passages(passages: &[SearchHit]) -> String {
    if passages.is_empty() {
        return NO_RESULTS.to_string();
    }

    passages
        .iter()
        .map(|p| format!("Source: {} (page {})\nContent: {}", p.source, p.page, p.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hit, StaticRetriever};

    #[test]
    fn test_format_passages() {
        let text = format_passages(&[hit("Alpha", 1), hit("Beta", 2)]);
        assert_eq!(
            text,
            "Source: guide.pdf (page 1)\nContent: Alpha\nSource: guide.pdf (page 2)\nContent: Beta"
        );
        assert_eq!(format_passages(&[]), NO_RESULTS);
    }

    #[tokio::test]
    async fn test_invoke_attaches_passages() {
        let retriever = Arc::new(StaticRetriever::new(vec![
            hit("Alpha", 1),
            hit("Beta", 2),
            hit("Gamma", 3),
        ]));
        let tool = RetrieveTool::new(retriever.clone(), 2);

        let call = ToolCall {
            id: "call_1".into(),
            name: RETRIEVE_TOOL.into(),
            arguments: json!({"query": "alpha"}),
        };
        let message = tool.invoke(&call, Uuid::nil()).await.unwrap();

        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert!(message.content.contains("Content: Alpha"));
        assert!(!message.content.contains("Gamma"));
        let artifact = message.artifact.unwrap();
        assert_eq!(artifact.as_array().unwrap().len(), 2);
        assert_eq!(retriever.queries(), vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_calls_are_answered_in_band() {
        let retriever = Arc::new(StaticRetriever::new(vec![]));
        let tool = RetrieveTool::new(retriever.clone(), 2);

        let unknown = ToolCall {
            id: "a".into(),
            name: "browse".into(),
            arguments: json!({}),
        };
        assert!(tool
            .invoke(&unknown, Uuid::nil())
            .await
            .unwrap()
            .content
            .contains("Unknown tool"));

        let empty = ToolCall {
            id: "b".into(),
            name: RETRIEVE_TOOL.into(),
            arguments: json!({"query": "  "}),
        };
        assert!(tool
            .invoke(&empty, Uuid::nil())
            .await
            .unwrap()
            .content
            .contains("non-empty"));
        assert!(retriever.queries().is_empty());
    }
}
