//! Cevra ingestion
//!
//! PDF extraction, text chunking, the ingestion pipeline and the storage
//! catalog that owns per-storage vector collections.

pub mod catalog;
pub mod chunker;
pub mod errors;
pub mod pdf;
pub mod pipeline;

pub use catalog::{ItemListing, StorageCatalog, StorageView};
pub use chunker::{Chunker, TextChunk};
pub use errors::IngestionError;
pub use pdf::{extract_pages, PageText};
pub use pipeline::{IngestionPipeline, UploadedFile};
