//! # Private RAG
//!
//! Retrieval-augmented generation over private documents, with the
//! pipelines from `private-rag-core` wired to concrete backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │   Loader    │──▶│ IngestionPipeline│──▶│ SQLite/memory │
//! │ md/txt/pdf  │   │ split+embed+put  │   │ nodes+vectors │
//! └─────────────┘   └──────────────────┘   └──────┬────────┘
//!                                                 │
//!                        ┌────────────────────────┤
//!                        ▼                        ▼
//!                  ┌──────────┐  ChatEngine  ┌──────────┐
//!                  │   CLI    │◀────────────▶│   HTTP   │
//!                  │  (prag)  │              │  (axum)  │
//!                  └──────────┘              └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`components`] | Builds backends and pipelines from config |
//! | [`loader`] | File and folder loading, PDF/DOCX extraction |
//! | [`embedding`] | Embedding provider selection |
//! | [`llm`] | LLM provider selection |
//! | [`sqlite_store`] | SQLite node store and vector index |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod commands;
pub mod components;
pub mod config;
pub mod db;
pub mod embedding;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
