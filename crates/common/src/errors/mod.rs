//! Error types for Cevra services
//!
//! Provides a single error enum shared by every crate with:
//! - Distinct variants for the failure modes of ingestion, retrieval and chat
//! - A coarse [`ErrorKind`] used for propagation decisions
//! - HTTP status code mapping and structured JSON error bodies
//! - Stable numeric error codes for client handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    UnsupportedFileType,
    FileTooLarge,
    PayloadTooLarge,
    UnsupportedFormat,

    // Resource errors (4xxx)
    StorageNotFound,
    ItemNotFound,
    ChatNotFound,

    // Conflict errors (5xxx)
    Conflict,

    // Rate limiting (6xxx)
    RateLimited,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingError,
    LlmError,
    VectorStoreError,
    CollectionNotFound,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
    Cancelled,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::UnsupportedFileType => 1003,
            ErrorCode::FileTooLarge => 1004,
            ErrorCode::PayloadTooLarge => 1005,
            ErrorCode::UnsupportedFormat => 1006,

            // Resources (4xxx)
            ErrorCode::StorageNotFound => 4002,
            ErrorCode::ItemNotFound => 4003,
            ErrorCode::ChatNotFound => 4004,

            // Conflicts (5xxx)
            ErrorCode::Conflict => 5001,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::LlmError => 8003,
            ErrorCode::VectorStoreError => 8004,
            ErrorCode::CollectionNotFound => 8005,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
            ErrorCode::Cancelled => 9004,
        }
    }
}

/// Coarse classification used when deciding how far an error may travel
/// and how much of it the caller gets to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Upstream,
    Internal,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Unsupported file type: {mime_type} (only PDF documents are accepted)")]
    UnsupportedFileType { mime_type: String },

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Request body exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("Unsupported document format: {message}")]
    UnsupportedFormat { message: String },

    // Resource errors
    #[error("Storage not found: {id}")]
    StorageNotFound { id: String },

    #[error("Item not found: {id}")]
    ItemNotFound { id: String },

    #[error("Chat not found: {id}")]
    ChatNotFound { id: String },

    // Conflict errors
    #[error("Conflict: {message}")]
    Conflict { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per minute")]
    RateLimited { limit: u32 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("LLM provider error: {message}")]
    LlmError { message: String },

    #[error("Vector store error: {message}")]
    VectorStore { message: String },

    #[error("Vector collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled by the client")]
    Cancelled,

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::UnsupportedFileType { .. } => ErrorCode::UnsupportedFileType,
            AppError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            AppError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AppError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            AppError::StorageNotFound { .. } => ErrorCode::StorageNotFound,
            AppError::ItemNotFound { .. } => ErrorCode::ItemNotFound,
            AppError::ChatNotFound { .. } => ErrorCode::ChatNotFound,
            AppError::Conflict { .. } => ErrorCode::Conflict,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::LlmError { .. } => ErrorCode::LlmError,
            AppError::VectorStore { .. } => ErrorCode::VectorStoreError,
            AppError::CollectionNotFound { .. } => ErrorCode::CollectionNotFound,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Cancelled => ErrorCode::Cancelled,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::StorageNotFound { .. }
            | AppError::ItemNotFound { .. }
            | AppError::ChatNotFound { .. } => ErrorKind::NotFound,

            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::UnsupportedFileType { .. }
            | AppError::FileTooLarge { .. }
            | AppError::PayloadTooLarge { .. }
            | AppError::UnsupportedFormat { .. }
            | AppError::Conflict { .. }
            | AppError::RateLimited { .. } => ErrorKind::Validation,

            AppError::EmbeddingError { .. }
            | AppError::LlmError { .. }
            | AppError::VectorStore { .. }
            | AppError::HttpClient(_) => ErrorKind::Upstream,

            // A missing collection behind an existing storage row is a consistency bug
            AppError::CollectionNotFound { .. }
            | AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Cancelled
            | AppError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } | AppError::MissingField { .. } => {
                StatusCode::BAD_REQUEST
            }

            // 404 Not Found
            AppError::StorageNotFound { .. }
            | AppError::ItemNotFound { .. }
            | AppError::ChatNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Conflict { .. } => StatusCode::CONFLICT,

            // 413 Payload Too Large
            AppError::FileTooLarge { .. } | AppError::PayloadTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }

            // 415 Unsupported Media Type
            AppError::UnsupportedFileType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,

            // 422 Unprocessable Entity
            AppError::UnsupportedFormat { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 499 Client Closed Request (nginx convention)
            AppError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::CollectionNotFound { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::EmbeddingError { .. }
            | AppError::LlmError { .. }
            | AppError::VectorStore { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message safe to hand to API clients.
    ///
    /// Client errors explain which constraint was violated; upstream and
    /// internal failures collapse to a generic sentence so provider details
    /// and SQL never leak.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Validation => self.to_string(),
            ErrorKind::Upstream => "An upstream service failed to process the request".to_string(),
            ErrorKind::Internal => "An internal error occurred".to_string(),
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({ "field": field })),
            AppError::FileTooLarge { size, limit } => {
                Some(serde_json::json!({ "size": size, "limit": limit }))
            }
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message: self.public_message(),
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::VectorStore {
            message: err.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: err.to_string(),
            field,
        }
    }
}
