//! In-memory [`NodeStore`] and [`VectorIndex`] implementations.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety. Locks are
//! never held across an `.await`. Vector search is brute-force cosine
//! similarity over all stored vectors.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Backend, RagError, Result};
use crate::models::{Metadata, Node, SearchFilter};

use super::{sort_matches, NodeStore, VectorIndex, VectorMatch};

fn read<'a, T>(lock: &'a RwLock<T>, backend: Backend) -> Result<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| RagError::backend(backend, "lock poisoned"))
}

fn write<'a, T>(lock: &'a RwLock<T>, backend: Backend) -> Result<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| RagError::backend(backend, "lock poisoned"))
}

/// In-memory node store for tests and the `memory` storage backend.
///
/// Vectors belong to the index, so stored nodes drop their embedding.
#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<String, Node>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn put(&self, node: &Node) -> Result<()> {
        let mut stored = node.clone();
        stored.embedding = None;
        let mut nodes = write(&self.nodes, Backend::NodeStore)?;
        nodes.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        let nodes = read(&self.nodes, Backend::NodeStore)?;
        Ok(nodes.get(node_id).cloned())
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        let mut nodes = write(&self.nodes, Backend::NodeStore)?;
        nodes.remove(node_id);
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut nodes = write(&self.nodes, Backend::NodeStore)?;
        let before = nodes.len();
        nodes.retain(|_, n| n.document_id != document_id);
        Ok(before - nodes.len())
    }

    async fn list_by_document(&self, document_id: &str) -> Result<Vec<Node>> {
        let nodes = read(&self.nodes, Backend::NodeStore)?;
        let mut out: Vec<Node> = nodes
            .values()
            .filter(|n| n.document_id == document_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let nodes = read(&self.nodes, Backend::NodeStore)?;
        let ids: BTreeSet<String> = nodes.values().map(|n| n.document_id.clone()).collect();
        Ok(ids.into_iter().collect())
    }
}

struct StoredVector {
    document_id: String,
    vector: Vec<f32>,
}

/// In-memory brute-force vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    vectors: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of vectors belonging to `document_id`.
    pub fn count_for_document(&self, document_id: &str) -> usize {
        self.vectors
            .read()
            .map(|v| v.values().filter(|s| s.document_id == document_id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        node_id: &str,
        document_id: &str,
        vector: &[f32],
        _metadata: &Metadata,
    ) -> Result<()> {
        let mut vectors = write(&self.vectors, Backend::VectorIndex)?;
        vectors.insert(
            node_id.to_string(),
            StoredVector {
                document_id: document_id.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        let mut vectors = write(&self.vectors, Backend::VectorIndex)?;
        vectors.remove(node_id);
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut vectors = write(&self.vectors, Backend::VectorIndex)?;
        let before = vectors.len();
        vectors.retain(|_, v| v.document_id != document_id);
        Ok(before - vectors.len())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>> {
        let vectors = read(&self.vectors, Backend::VectorIndex)?;
        let mut matches: Vec<VectorMatch> = vectors
            .iter()
            .filter(|(_, sv)| filter.matches(&sv.document_id))
            .map(|(id, sv)| VectorMatch {
                node_id: id.clone(),
                score: cosine_similarity(vector, &sv.vector),
            })
            .collect();
        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }
}
