//! Tool-calling agent loop
//!
//! Each turn runs an explicit state machine:
//!
//! ```text
//! Idle -> Responding -> (Retrieving -> Responding)* -> Done
//! ```
//!
//! `Idle` condenses the history, `Responding` calls the model,
//! `Retrieving` executes the requested tool calls in order. After
//! `max_tool_rounds` retrievals the model is called without tools so the
//! turn always terminates.
//!
//! Summarization runs once per turn, before its first model call, so the
//! question being answered always reaches the model verbatim. Within a
//! turn the history therefore grows past `messages_to_keep` by at most the
//! user message, one assistant message per tool round and one tool result
//! per call; the next turn condenses it again.

use crate::prompt::SYSTEM_PROMPT;
use crate::state::{AgentState, StepEvent};
use crate::summarize::Summarizer;
use crate::tool::RetrieveTool;
use cevra_common::config::{AgentConfig, LlmConfig};
use cevra_common::errors::{AppError, Result};
use cevra_common::llm::{ChatModel, CompletionRequest, Message, ToolCall};
use cevra_search::Retriever;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use uuid::Uuid;

enum Phase {
    Idle,
    Responding,
    Retrieving(Vec<ToolCall>),
    Done(Message),
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    tool: RetrieveTool,
    summarizer: Summarizer,
    max_tool_rounds: usize,
    temperature: f32,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        agent: &AgentConfig,
        llm: &LlmConfig,
    ) -> Self {
        Self {
            tool: RetrieveTool::new(retriever, agent.retrieval_k),
            summarizer: Summarizer::new(model.clone(), agent.messages_to_keep),
            model,
            max_tool_rounds: agent.max_tool_rounds,
            temperature: llm.temperature,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Answer `query` against the documents of `storage_id`, appending
    /// every step to `state`. Steps are also sent to `events` when given;
    /// a closed receiver cancels the turn.
    #[instrument(skip_all, fields(%storage_id))]
    pub async fn run(
        &self,
        state: &mut AgentState,
        query: &str,
        storage_id: Uuid,
        events: Option<&mpsc::Sender<StepEvent>>,
    ) -> Result<Message> {
        let question = Message::user(query);
        emit(events, &question).await?;
        state.messages.push(question);

        let mut rounds = 0;
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => {
                    let history = std::mem::take(&mut state.messages);
                    state.messages = self.summarizer.apply(history).await?;
                    Phase::Responding
                }
                Phase::Responding => {
                    let tools_allowed = rounds < self.max_tool_rounds;
                    let mut reply = self.complete(state, tools_allowed).await?;

                    if reply.requests_tools() && tools_allowed {
                        let calls = reply.tool_calls.clone();
                        emit(events, &reply).await?;
                        state.messages.push(reply);
                        Phase::Retrieving(calls)
                    } else {
                        // Calls without an offered tool would leave unanswered requests
                        reply.tool_calls.clear();
                        emit(events, &reply).await?;
                        state.messages.push(reply.clone());
                        Phase::Done(reply)
                    }
                }
                Phase::Retrieving(calls) => {
                    rounds += 1;
                    debug!(round = rounds, calls = calls.len(), "Executing tool calls");
                    for call in &calls {
                        let result = self.tool.invoke(call, storage_id).await?;
                        emit(events, &result).await?;
                        state.messages.push(result);
                    }
                    Phase::Responding
                }
                Phase::Done(reply) => return Ok(reply),
            };
        }
    }

    async fn complete(&self, state: &AgentState, with_tools: bool) -> Result<Message> {
        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        messages.push(Message::system(SYSTEM_PROMPT));
        messages.extend(state.messages.iter().cloned());

        self.model
            .complete(CompletionRequest {
                messages,
                tools: if with_tools {
                    vec![self.tool.spec()]
                } else {
                    Vec::new()
                },
                temperature: Some(self.temperature),
            })
            .await
    }
}

async fn emit(events: Option<&mpsc::Sender<StepEvent>>, message: &Message) -> Result<()> {
    match events {
        Some(tx) => tx
            .send(StepEvent::from_message(message))
            .await
            .map_err(|_| AppError::Cancelled),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StepKind;
    use crate::testing::{hit, tool_call, ScriptedModel, StaticRetriever};
    use cevra_common::llm::Role;

    fn agent(model: Arc<ScriptedModel>, retriever: Arc<StaticRetriever>) -> Agent {
        Agent::new(
            model,
            retriever,
            &AgentConfig::default(),
            &LlmConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_retrieve_then_answer() {
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant_with_tool_calls("", vec![tool_call("c1", "alpha")]),
            Message::assistant("Alpha is on page 1."),
        ]));
        let retriever = Arc::new(StaticRetriever::new(vec![hit("Alpha Beta", 1)]));
        let agent = agent(model.clone(), retriever.clone());

        let mut state = AgentState::default();
        let reply = agent
            .run(&mut state, "What is alpha?", Uuid::nil(), None)
            .await
            .unwrap();

        assert_eq!(reply.content, "Alpha is on page 1.");
        let roles: Vec<Role> = state.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(retriever.queries(), vec!["alpha".to_string()]);

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].messages[0].content, SYSTEM_PROMPT);
        assert_eq!(requests[0].tools.len(), 1);
        assert!(requests[1].messages.last().unwrap().content.contains("Alpha Beta"));
    }

    #[tokio::test]
    async fn test_direct_answer_skips_retrieval() {
        let model = Arc::new(ScriptedModel::new(vec![Message::assistant("Hello!")]));
        let retriever = Arc::new(StaticRetriever::new(vec![]));
        let agent = agent(model, retriever.clone());

        let mut state = AgentState::default();
        agent.run(&mut state, "hi", Uuid::nil(), None).await.unwrap();

        assert_eq!(state.messages.len(), 2);
        assert!(retriever.queries().is_empty());
    }

    #[tokio::test]
    async fn test_tool_rounds_are_capped() {
        let greedy: Vec<Message> = (0..10)
            .map(|i| {
                Message::assistant_with_tool_calls("", vec![tool_call(&format!("c{}", i), "more")])
            })
            .collect();
        let model = Arc::new(ScriptedModel::new(greedy));
        let retriever = Arc::new(StaticRetriever::new(vec![hit("x", 1)]));
        let config = AgentConfig {
            max_tool_rounds: 2,
            ..AgentConfig::default()
        };
        let agent = Agent::new(model.clone(), retriever.clone(), &config, &LlmConfig::default());

        let mut state = AgentState::default();
        let reply = agent.run(&mut state, "loop", Uuid::nil(), None).await.unwrap();

        assert!(!reply.requests_tools());
        assert_eq!(retriever.queries().len(), 2);
        let requests = model.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].tools.is_empty());
    }

    #[tokio::test]
    async fn test_steps_are_streamed() {
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant_with_tool_calls("", vec![tool_call("c1", "alpha")]),
            Message::assistant("done"),
        ]));
        let agent = agent(model, Arc::new(StaticRetriever::new(vec![hit("Alpha", 1)])));
        let (tx, mut rx) = mpsc::channel(16);

        let mut state = AgentState::default();
        agent
            .run(&mut state, "q", Uuid::nil(), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![StepKind::Human, StepKind::Ai, StepKind::Tool, StepKind::Ai]
        );
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels() {
        let model = Arc::new(ScriptedModel::new(vec![Message::assistant("unused")]));
        let agent = agent(model.clone(), Arc::new(StaticRetriever::new(vec![])));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut state = AgentState::default();
        let err = agent
            .run(&mut state, "q", Uuid::nil(), Some(&tx))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_summarized_before_the_model_call() {
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant("condensed"),
            Message::assistant("final"),
        ]));
        let agent = agent(model.clone(), Arc::new(StaticRetriever::new(vec![])));

        let mut state = AgentState::default();
        for i in 0..3 {
            state.messages.push(Message::user(format!("q{}", i)));
            state.messages.push(Message::assistant(format!("a{}", i)));
        }

        agent.run(&mut state, "next", Uuid::nil(), None).await.unwrap();

        let requests = model.requests();
        let answer_request = &requests[1];
        // system prompt, summary, then the five most recent messages
        assert_eq!(answer_request.messages.len(), 7);
        assert!(answer_request.messages[1].summary);
        assert!(!answer_request.messages.iter().any(|m| m.content == "q0"));
        assert_eq!(state.messages.iter().filter(|m| m.summary).count(), 1);
    }

    #[tokio::test]
    async fn test_tool_rounds_do_not_resummarize_within_a_turn() {
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant("condensed"),
            Message::assistant_with_tool_calls("", vec![tool_call("c1", "alpha")]),
            Message::assistant_with_tool_calls("", vec![tool_call("c2", "beta")]),
            Message::assistant("final"),
        ]));
        let agent = agent(model.clone(), Arc::new(StaticRetriever::new(vec![hit("x", 1)])));

        let mut state = AgentState::default();
        for i in 0..3 {
            state.messages.push(Message::user(format!("q{}", i)));
            state.messages.push(Message::assistant(format!("a{}", i)));
        }

        agent.run(&mut state, "next", Uuid::nil(), None).await.unwrap();

        let requests = model.requests();
        // one summary request, then three answer requests
        assert_eq!(requests.len(), 4);
        assert!(requests[0].tools.is_empty());
        for request in &requests[1..] {
            assert!(request.messages.iter().any(|m| m.content == "next"));
            assert_eq!(request.messages.iter().filter(|m| m.summary).count(), 1);
        }
        // summary, the five kept ending with the question, two tool rounds, answer
        assert_eq!(state.messages.len(), 11);
    }
}
