//! Storage abstractions for ingested chunks.
//!
//! Two capability traits split persistence the way retrieval uses it:
//!
//! | Trait | Holds | Used for |
//! |-------|-------|----------|
//! | [`NodeStore`] | chunk text, offsets, metadata | resolving search hits, listing a document's chunks |
//! | [`VectorIndex`] | one vector per node id | top-k similarity search |
//!
//! The ingestion pipeline is the only writer of both and keeps them paired.
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{Metadata, Node, SearchFilter};

/// One hit from a vector search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorMatch {
    pub node_id: String,
    pub score: f32,
}

/// Persists chunk records keyed by node id.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put`](NodeStore::put) | Insert or replace a node |
/// | [`get`](NodeStore::get) | Fetch a node by id |
/// | [`delete`](NodeStore::delete) | Remove a single node (no-op if absent) |
/// | [`delete_by_document`](NodeStore::delete_by_document) | Remove every node of a document |
/// | [`list_by_document`](NodeStore::list_by_document) | A document's nodes, ordered by position |
/// | [`document_ids`](NodeStore::document_ids) | Every document id with at least one node |
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn put(&self, node: &Node) -> Result<()>;

    async fn get(&self, node_id: &str) -> Result<Option<Node>>;

    async fn delete(&self, node_id: &str) -> Result<()>;

    /// Returns the number of nodes removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    async fn list_by_document(&self, document_id: &str) -> Result<Vec<Node>>;

    async fn document_ids(&self) -> Result<Vec<String>>;
}

/// Persists vectors keyed by node id and answers similarity queries.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        node_id: &str,
        document_id: &str,
        vector: &[f32],
        metadata: &Metadata,
    ) -> Result<()>;

    async fn delete(&self, node_id: &str) -> Result<()>;

    /// Returns the number of vectors removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    /// Up to `top_k` matches ordered by descending score.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>>;
}

/// Sort matches by descending score, breaking ties by node id.
pub fn sort_matches(matches: &mut [VectorMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}
