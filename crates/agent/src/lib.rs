//! Cevra agent
//!
//! The retrieval-augmented conversational agent and the chat orchestrator
//! that persists its turns.

pub mod agent;
pub mod orchestrator;
pub mod prompt;
pub mod state;
pub mod summarize;
pub mod tool;

pub use agent::Agent;
pub use orchestrator::{ChatDetail, ChatOrchestrator, ChatStream};
pub use state::{AgentState, CheckpointStore, StepEvent, StepKind};
pub use summarize::Summarizer;
pub use tool::{RetrieveTool, ToolOutput};
