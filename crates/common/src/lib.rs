//! Cevra Common Library
//!
//! Shared code for every Cevra crate:
//! - Configuration management
//! - Database models and repository patterns
//! - Embedding and chat model abstractions
//! - Per-collection vector store adapters
//! - Error types and handling
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod vector;

mod upstream;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::ChatModel;
pub use vector::{VectorCollection, VectorStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
