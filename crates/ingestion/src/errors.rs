//! Ingestion error types

use cevra_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Not a PDF document")]
    NotPdf,

    #[error("PDF parse error: {message}")]
    PdfParse { message: String },

    #[error("Invalid chunking configuration: {0}")]
    ChunkConfig(String),

    #[error("Extraction task failed: {0}")]
    Task(String),
}

impl From<IngestionError> for AppError {
    fn from(err: IngestionError) -> Self {
        match err {
            IngestionError::NotPdf | IngestionError::PdfParse { .. } => {
                AppError::UnsupportedFormat {
                    message: err.to_string(),
                }
            }
            IngestionError::ChunkConfig(message) => AppError::Configuration { message },
            IngestionError::Task(message) => AppError::Internal { message },
        }
    }
}
