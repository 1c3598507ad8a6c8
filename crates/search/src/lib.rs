//! Cevra search
//!
//! Similarity retrieval over the vector collection of one storage.

pub mod retrieval;

pub use retrieval::{RetrievalService, Retriever, SearchHit};
