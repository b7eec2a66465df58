//! # private-rag core
//!
//! The RAG orchestration core: data model, error taxonomy, text splitter,
//! backend capability traits, and the two pipelines built on them.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`splitter`] | Deterministic overlapping chunk spans |
//! | [`embedding`] | [`EmbeddingService`](embedding::EmbeddingService) trait, mock backend, vector helpers |
//! | [`store`] | [`NodeStore`](store::NodeStore) / [`VectorIndex`](store::VectorIndex) traits and in-memory backends |
//! | [`llm`] | [`LlmService`](llm::LlmService) trait and mock backend |
//! | [`ingest`] | [`IngestionPipeline`](ingest::IngestionPipeline): split → embed → persist, with rollback |
//! | [`chat`] | [`ChatEngine`](chat::ChatEngine): retrieve → assemble context → generate |
//! | [`cancel`] | Cooperative cancellation for streamed generation |
//!
//! This crate contains no sqlx, axum, or filesystem I/O. Concrete
//! persistent backends live in the application crate and are injected
//! through the traits above.

pub mod cancel;
pub mod chat;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod splitter;
pub mod store;

pub use error::{Backend, RagError, Result};
