//! Configuration management for Cevra services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Conventional variables (DATABASE_URL, OPENAI_API_KEY, PORT) as defaults
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index backend
    #[serde(default)]
    pub vector: VectorConfig,

    /// Chat model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Conversational agent tuning
    #[serde(default)]
    pub agent: AgentConfig,

    /// Document ingestion limits and chunking
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Similarity search
    #[serde(default)]
    pub search: SearchConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (streaming chats hold the connection for the whole generation)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Allowed CORS origins, empty means any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create missing tables and indexes at start-up
    #[serde(default = "default_enabled")]
    pub auto_create_schema: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_openai_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// Total time budget for retries in seconds
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,

    /// Batch size for embedding requests
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorConfig {
    /// Vector backend: pgvector, memory
    #[serde(default = "default_vector_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat model provider: openai, mock
    #[serde(default = "default_openai_provider")]
    pub provider: String,

    pub api_key: Option<String>,

    pub api_base: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// Total time budget for retries in seconds
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Messages retained verbatim before older turns are summarized
    #[serde(default = "default_messages_to_keep")]
    pub messages_to_keep: usize,

    /// Passages returned by the retrieval tool
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,

    /// Tool rounds allowed per turn before the model must answer
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Step events buffered between the agent and a streaming client
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between consecutive chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name attached to log lines
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

/// Per-operation-class limits, all expressed per minute
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_upload_limit")]
    pub upload_per_minute: u32,

    #[serde(default = "default_search_limit")]
    pub search_per_minute: u32,

    #[serde(default = "default_chat_limit")]
    pub chat_per_minute: u32,

    #[serde(default = "default_stream_limit")]
    pub stream_per_minute: u32,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3000 }
fn default_request_timeout() -> u64 { 120 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_concurrent() -> usize { 256 }
fn default_database_url() -> String { "postgres://localhost/cevra".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_openai_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_upstream_timeout() -> u64 { 60 }
fn default_retry_budget() -> u64 { 30 }
fn default_batch_size() -> usize { 100 }
fn default_vector_backend() -> String { "pgvector".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.0 }
fn default_messages_to_keep() -> usize { 5 }
fn default_retrieval_k() -> usize { 2 }
fn default_max_tool_rounds() -> usize { 4 }
fn default_stream_buffer() -> usize { 16 }
fn default_chunk_size() -> usize { 500 }
fn default_chunk_overlap() -> usize { 50 }
fn default_max_file_size() -> u64 { 10 * 1024 * 1024 }
fn default_allowed_mime_types() -> Vec<String> { vec!["application/pdf".to_string()] }
fn default_top_k() -> usize { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "cevra".to_string() }
fn default_upload_limit() -> u32 { 5 }
fn default_search_limit() -> u32 { 30 }
fn default_chat_limit() -> u32 { 20 }
fn default_stream_limit() -> u32 { 10 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let mut builder = Config::builder();

        // Conventional variables only seed defaults, APP__ keys still win
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_default("database.url", url)?;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            builder = builder
                .set_default("llm.api_key", key.clone())?
                .set_default("embedding.api_key", key)?;
        }
        if let Ok(port) = std::env::var("PORT") {
            builder = builder.set_default("server.port", port)?;
        }

        let config = builder
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file, still honouring APP__ overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }

    /// Fully offline setup: SQLite in memory, hashed embeddings, in-process
    /// vectors and the scripted chat model. Used by tests and local demos.
    pub fn offline() -> Self {
        let mut config = Self::default();
        config.database.url = "sqlite::memory:".to_string();
        config.embedding.provider = "mock".to_string();
        config.embedding.dimension = 1024;
        config.vector.backend = "memory".to_string();
        config.llm.provider = "mock".to_string();
        config.observability.metrics_port = 0;
        config
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_concurrent_requests: default_max_concurrent(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            auto_create_schema: default_enabled(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_openai_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_upstream_timeout(),
            retry_budget_secs: default_retry_budget(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_openai_provider(),
            api_key: None,
            api_base: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_secs: default_upstream_timeout(),
            retry_budget_secs: default_retry_budget(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            messages_to_keep: default_messages_to_keep(),
            retrieval_k: default_retrieval_k(),
            max_tool_rounds: default_max_tool_rounds(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_file_size_bytes: default_max_file_size(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            upload_per_minute: default_upload_limit(),
            search_per_minute: default_search_limit(),
            chat_per_minute: default_chat_limit(),
            stream_per_minute: default_stream_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.ingestion.chunk_size, 500);
        assert_eq!(config.ingestion.chunk_overlap, 50);
        assert_eq!(config.ingestion.max_file_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.agent.messages_to_keep, 5);
        assert_eq!(config.agent.retrieval_k, 2);
        assert_eq!(config.search.top_k, 5);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/cevra");
    }

    #[test]
    fn test_sections_default_when_missing() {
        let config: AppConfig = serde_json::from_str(r#"{"server": {"port": 4000}}"#).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.rate_limit.upload_per_minute, 5);
        assert_eq!(config.rate_limit.stream_per_minute, 10);
        assert_eq!(config.vector.backend, "pgvector");
    }

    #[test]
    fn test_offline_profile() {
        let config = AppConfig::offline();
        assert_eq!(config.vector.backend, "memory");
        assert_eq!(config.llm.provider, "mock");
        assert!(config.database.url.starts_with("sqlite"));
    }
}
