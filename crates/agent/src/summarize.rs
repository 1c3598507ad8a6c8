//! Rolling summarization of long histories
//!
//! Once more than `keep` messages (excluding the summary itself) are in
//! the history, everything but the most recent `keep` is condensed by the
//! model into a single summary message placed at the front.

use crate::prompt::{SUMMARY_PREFIX, SUMMARY_PROMPT};
use cevra_common::errors::Result;
use cevra_common::llm::{ChatModel, CompletionRequest, Message, Role};
use cevra_common::metrics::record_summary;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct Summarizer {
    model: Arc<dyn ChatModel>,
    keep: usize,
}

impl Summarizer {
    pub fn new(model: Arc<dyn ChatModel>, keep: usize) -> Self {
        Self {
            model,
            keep: keep.max(1),
        }
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Index of the first kept message, or `None` when nothing needs
    /// condensing. Tool results stay with the assistant turn that
    /// requested them.
    fn cut_point(&self, conversation: &[Message]) -> Option<usize> {
        if conversation.len() <= self.keep {
            return None;
        }

        let mut cut = conversation.len() - self.keep;
        while cut > 0 && conversation[cut].role == Role::Tool {
            cut -= 1;
        }
        (cut > 0).then_some(cut)
    }

    #[instrument(skip_all, fields(history = messages.len()))]
    pub async fn apply(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        let (summaries, conversation): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(|m| m.summary);

        let Some(cut) = self.cut_point(&conversation) else {
            return Ok(summaries.into_iter().chain(conversation).collect());
        };

        let mut conversation = conversation;
        let kept = conversation.split_off(cut);
        let transcript = transcript(&summaries, &conversation);

        let reply = self
            .model
            .complete(CompletionRequest {
                messages: vec![Message::system(SUMMARY_PROMPT), Message::user(transcript)],
                tools: Vec::new(),
                temperature: Some(0.0),
            })
            .await?;

        record_summary();
        debug!(condensed = conversation.len(), kept = kept.len(), "History summarized");

        let summary = Message::summary(format!("{} {}", SUMMARY_PREFIX, reply.content.trim()));
        Ok(std::iter::once(summary).chain(kept).collect())
    }
}

fn transcript(summaries: &[Message], condensed: &[Message]) -> String {
    let mut lines: Vec<String> = summaries
        .iter()
        .map(|s| {
            let text = s.content.strip_prefix(SUMMARY_PREFIX).unwrap_or(&s.content);
            format!("Previous summary: {}", text.trim())
        })
        .collect();

    for message in condensed {
        let line = match message.role {
            Role::User => format!("User: {}", message.content),
            Role::Assistant if message.requests_tools() => {
                let queries: Vec<String> = message
                    .tool_calls
                    .iter()
                    .map(|c| {
                        c.arguments
                            .get("query")
                            .and_then(|q| q.as_str())
                            .unwrap_or_default()
                            .to_string()
                    })
                    .collect();
                format!("Assistant searched the documents for: {}", queries.join("; "))
            }
            Role::Assistant => format!("Assistant: {}", message.content),
            Role::Tool => format!("Retrieved: {}", message.content),
            Role::System => format!("System: {}", message.content),
        };
        lines.push(line);
    }

    lines.join("\n")
}
