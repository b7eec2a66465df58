//! Ingestion pipeline orchestration.
//!
//! Coordinates the write path: split → embed → node store → vector index,
//! and keeps a per-document status ledger.
//!
//! # State machine
//!
//! ```text
//! PENDING → EMBEDDING → PERSISTING → COMPLETED
//!               │            │
//!               └────────────┴──→ FAILED
//! ```
//!
//! # Consistency
//!
//! The pipeline is the only writer of both stores. Writes go through a
//! single write gate, so node-id writes of different documents never
//! interleave, and calls for the same document id are serialized by a
//! per-document lock. An embedding failure happens before any write. A
//! failed store write rolls back every node id written by that attempt
//! from both stores before the error is returned; if the rollback itself
//! fails the error becomes [`RagError::Consistency`]. Writes run on their
//! own task, so a caller that stops waiting cannot leave a half-written
//! document behind.
//!
//! Re-ingesting a document writes a fresh generation of nodes and only
//! then removes the previous generation, so a failed re-ingest leaves the
//! old nodes in place.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::embedding::EmbeddingService;
use crate::error::{with_timeout, Backend, RagError, Result};
use crate::models::{now_micros, Document, IngestStatus, IngestedDocumentRecord, Metadata, Node};
use crate::splitter::{content_hash, Span, TextSplitter};
use crate::store::{NodeStore, VectorIndex};

/// Metadata key recorded by [`IngestionPipeline::ingest_text`].
pub const FILE_NAME_KEY: &str = "file_name";

/// Tuning knobs for the write path.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Texts per embedding request.
    pub batch_size: usize,
    /// Documents ingested in parallel by [`IngestionPipeline::ingest_many`].
    pub concurrency: usize,
    /// Deadline for every individual backend call.
    pub timeout: Option<Duration>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            concurrency: 4,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Write-side entry point.
///
/// Every write (`ingest`, `delete`, `wipe`) runs on its own task that the
/// caller awaits. Dropping the returned future does not interrupt it: the
/// write still persists or rolls back, and the ledger record still ends
/// in `Completed` or `Failed`.
pub struct IngestionPipeline {
    state: Arc<PipelineState>,
}

impl IngestionPipeline {
    pub fn new(
        splitter: TextSplitter,
        embedder: Arc<dyn EmbeddingService>,
        nodes: Arc<dyn NodeStore>,
        vectors: Arc<dyn VectorIndex>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            state: Arc::new(PipelineState::new(splitter, embedder, nodes, vectors, settings)),
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.state.settings
    }

    /// Split, embed, and persist one document.
    ///
    /// Returns the completed ledger record only after both stores have
    /// accepted every node. A concurrent call for the same document id
    /// waits for this one to finish.
    pub async fn ingest(&self, document: Document) -> Result<IngestedDocumentRecord> {
        let state = self.state.clone();
        let what = format!("ingestion of '{}'", document.id);
        join_write(&what, tokio::spawn(async move { state.ingest(document).await })).await
    }

    /// Ingest raw text under a freshly generated document id.
    pub async fn ingest_text(&self, file_name: &str, text: &str) -> Result<IngestedDocumentRecord> {
        let doc = Document::new(Uuid::new_v4().to_string(), text)
            .with_metadata(FILE_NAME_KEY, file_name);
        self.ingest(doc).await
    }

    /// Ingest several documents with bounded parallelism.
    ///
    /// Results come back in input order; one failure does not stop the rest.
    pub async fn ingest_many(
        &self,
        documents: Vec<Document>,
    ) -> Vec<Result<IngestedDocumentRecord>> {
        stream::iter(documents)
            .map(|doc| self.ingest(doc))
            .buffered(self.state.settings.concurrency)
            .collect()
            .await
    }

    /// Remove every node and vector owned by `document_id`.
    ///
    /// Idempotent: unknown ids are a no-op. Returns the number of nodes removed.
    pub async fn delete(&self, document_id: &str) -> Result<usize> {
        let state = self.state.clone();
        let id = document_id.to_string();
        let what = format!("deletion of '{}'", document_id);
        join_write(&what, tokio::spawn(async move { state.delete(&id).await })).await
    }

    /// Remove all documents, nodes, and vectors.
    ///
    /// Returns the number of documents removed.
    pub async fn wipe(&self) -> Result<usize> {
        let state = self.state.clone();
        join_write("wipe", tokio::spawn(async move { state.wipe().await })).await
    }

    /// Rebuild ledger entries for documents already present in the node store.
    ///
    /// Called at startup so persistent stores show up in [`list`](Self::list).
    pub async fn restore(&self) -> Result<usize> {
        self.state.restore().await
    }

    pub fn status(&self, document_id: &str) -> Option<IngestedDocumentRecord> {
        self.state.ledger_ref().get(document_id).cloned()
    }

    /// All ledger records, oldest first.
    pub fn list(&self) -> Vec<IngestedDocumentRecord> {
        let mut records: Vec<IngestedDocumentRecord> =
            self.state.ledger_ref().values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        records
    }
}

/// Await a detached write. A task that panicked leaves the stores in an
/// unknown state, so it surfaces as a consistency error.
async fn join_write<T>(what: &str, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "{} did not finish", what);
            Err(RagError::Consistency(format!("{} did not finish: {}", what, e)))
        }
    }
}

struct PipelineState {
    splitter: TextSplitter,
    embedder: Arc<dyn EmbeddingService>,
    nodes: Arc<dyn NodeStore>,
    vectors: Arc<dyn VectorIndex>,
    settings: IngestSettings,
    ledger: RwLock<HashMap<String, IngestedDocumentRecord>>,
    doc_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    write_gate: AsyncMutex<()>,
}

impl PipelineState {
    fn new(
        splitter: TextSplitter,
        embedder: Arc<dyn EmbeddingService>,
        nodes: Arc<dyn NodeStore>,
        vectors: Arc<dyn VectorIndex>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            splitter,
            embedder,
            nodes,
            vectors,
            settings: IngestSettings {
                batch_size: settings.batch_size.max(1),
                concurrency: settings.concurrency.max(1),
                timeout: settings.timeout,
            },
            ledger: RwLock::new(HashMap::new()),
            doc_locks: Mutex::new(HashMap::new()),
            write_gate: AsyncMutex::new(()),
        }
    }

    async fn ingest(&self, document: Document) -> Result<IngestedDocumentRecord> {
        validate_document_id(&document.id)?;
        let id = document.id.clone();
        let lock = self.document_lock(&id);
        let guard = lock.clone().lock_owned().await;
        let result = self.ingest_locked(document).await;
        drop(guard);
        self.release_document_lock(&id, lock);
        result
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        validate_document_id(document_id)?;
        let lock = self.document_lock(document_id);
        let guard = lock.clone().lock_owned().await;
        let result = async {
            let _gate = self.write_gate.lock().await;
            let removed = self.remove_document(document_id).await?;
            self.ledger_mut().remove(document_id);
            Ok(removed)
        }
        .await;
        drop(guard);
        self.release_document_lock(document_id, lock);

        if let Ok(removed) = &result {
            info!(document_id, nodes = *removed, "deleted document");
        }
        result
    }

    async fn wipe(&self) -> Result<usize> {
        let _gate = self.write_gate.lock().await;

        let mut ids: BTreeSet<String> = self.ledger_ref().keys().cloned().collect();
        let stored = with_timeout(
            Backend::NodeStore,
            self.settings.timeout,
            self.nodes.document_ids(),
        )
        .await?;
        ids.extend(stored);

        for id in &ids {
            self.remove_document(id).await?;
            self.ledger_mut().remove(id);
        }
        info!(documents = ids.len(), "wiped all documents");
        Ok(ids.len())
    }

    /// Only `Completed` records can be rebuilt; failures are not persisted.
    async fn restore(&self) -> Result<usize> {
        let ids = with_timeout(
            Backend::NodeStore,
            self.settings.timeout,
            self.nodes.document_ids(),
        )
        .await?;

        let mut restored = 0;
        for id in ids {
            if self.ledger_ref().contains_key(&id) {
                continue;
            }
            let nodes = with_timeout(
                Backend::NodeStore,
                self.settings.timeout,
                self.nodes.list_by_document(&id),
            )
            .await?;
            let created_at = nodes.iter().map(|n| n.created_at).min().unwrap_or(0);
            let metadata = nodes.first().map(|n| n.metadata.clone()).unwrap_or_default();
            self.ledger_mut().insert(
                id.clone(),
                IngestedDocumentRecord {
                    document_id: id,
                    status: IngestStatus::Completed,
                    node_ids: nodes.into_iter().map(|n| n.id).collect(),
                    metadata,
                    error: None,
                    created_at,
                    updated_at: created_at,
                },
            );
            restored += 1;
        }
        debug!(restored, "restored ingestion ledger");
        Ok(restored)
    }

    // ── write path ──────────────────────────────────────────────────────

    async fn ingest_locked(&self, document: Document) -> Result<IngestedDocumentRecord> {
        let id = document.id.clone();
        self.begin_record(&document);

        let spans = self.splitter.split(&document.text);
        self.set_status(&id, IngestStatus::Embedding);

        let vectors = match self.embed_spans(&spans).await {
            Ok(v) => v,
            Err(e) => return Err(self.fail(&id, e)),
        };

        let created_at = now_micros();
        let new_nodes: Vec<Node> = spans
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(position, (span, vector))| make_node(&document, position, span, vector, created_at))
            .collect();
        let new_ids: Vec<String> = new_nodes.iter().map(|n| n.id.clone()).collect();

        self.set_status(&id, IngestStatus::Persisting);
        let _gate = self.write_gate.lock().await;

        if let Err(cause) = self.persist(&new_nodes).await {
            let err = self.rollback(&id, &new_nodes, cause).await;
            return Err(self.fail(&id, err));
        }

        if let Err(e) = self.remove_previous_generation(&id, &new_ids).await {
            return Err(self.fail(&id, e));
        }

        let record = {
            let mut ledger = self.ledger_mut();
            let record = ledger
                .entry(id.clone())
                .or_insert_with(|| new_record(&document));
            record.status = IngestStatus::Completed;
            record.node_ids = new_ids;
            record.error = None;
            record.updated_at = now_micros();
            record.clone()
        };
        info!(document_id = %id, nodes = record.node_ids.len(), "ingested document");
        Ok(record)
    }

    async fn embed_spans(&self, spans: &[Span]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
        let dims = self.embedder.dims();
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.settings.batch_size) {
            let vectors = with_timeout(
                Backend::Embedding,
                self.settings.timeout,
                self.embedder.embed(batch),
            )
            .await?;
            if vectors.len() != batch.len() {
                return Err(RagError::backend(
                    Backend::Embedding,
                    format!("expected {} vectors, got {}", batch.len(), vectors.len()),
                ));
            }
            if let Some(bad) = vectors.iter().find(|v| dims > 0 && v.len() != dims) {
                return Err(RagError::backend(
                    Backend::Embedding,
                    format!("expected {} dimensions, got {}", dims, bad.len()),
                ));
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Node store first, then vectors. Any error aborts.
    async fn persist(&self, nodes: &[Node]) -> Result<()> {
        let timeout = self.settings.timeout;
        for node in nodes {
            with_timeout(Backend::NodeStore, timeout, self.nodes.put(node)).await?;
        }
        for node in nodes {
            let vector = node.embedding.as_deref().unwrap_or_default();
            with_timeout(
                Backend::VectorIndex,
                timeout,
                self.vectors
                    .upsert(&node.id, &node.document_id, vector, &node.metadata),
            )
            .await?;
        }
        Ok(())
    }

    /// Undo every write of this attempt and hand back the error to surface.
    async fn rollback(&self, document_id: &str, nodes: &[Node], cause: RagError) -> RagError {
        warn!(document_id, nodes = nodes.len(), error = %cause, "rolling back failed ingestion");
        let timeout = self.settings.timeout;
        let mut failures = Vec::new();

        for node in nodes {
            if let Err(e) =
                with_timeout(Backend::VectorIndex, timeout, self.vectors.delete(&node.id)).await
            {
                failures.push(e.to_string());
            }
            if let Err(e) = with_timeout(Backend::NodeStore, timeout, self.nodes.delete(&node.id)).await {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            cause
        } else {
            error!(document_id, failures = failures.len(), "rollback failed");
            RagError::Consistency(format!(
                "ingestion of '{}' failed ({}) and rollback failed: {}",
                document_id,
                cause,
                failures.join("; ")
            ))
        }
    }

    async fn remove_previous_generation(&self, document_id: &str, keep: &[String]) -> Result<()> {
        let timeout = self.settings.timeout;
        let existing =
            with_timeout(Backend::NodeStore, timeout, self.nodes.list_by_document(document_id))
                .await?;
        let stale: Vec<Node> = existing
            .into_iter()
            .filter(|n| !keep.contains(&n.id))
            .collect();
        for node in &stale {
            with_timeout(Backend::VectorIndex, timeout, self.vectors.delete(&node.id)).await?;
            with_timeout(Backend::NodeStore, timeout, self.nodes.delete(&node.id)).await?;
        }
        if !stale.is_empty() {
            debug!(document_id, stale = stale.len(), "removed previous generation");
        }
        Ok(())
    }

    /// Vectors first so a search never returns an id whose node is gone.
    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let timeout = self.settings.timeout;
        with_timeout(
            Backend::VectorIndex,
            timeout,
            self.vectors.delete_by_document(document_id),
        )
        .await?;
        with_timeout(
            Backend::NodeStore,
            timeout,
            self.nodes.delete_by_document(document_id),
        )
        .await
    }

    // ── ledger ──────────────────────────────────────────────────────────

    fn ledger_ref(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, IngestedDocumentRecord>> {
        self.ledger.read().unwrap_or_else(|e| e.into_inner())
    }

    fn ledger_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, IngestedDocumentRecord>> {
        self.ledger.write().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_record(&self, document: &Document) {
        let mut ledger = self.ledger_mut();
        let record = ledger
            .entry(document.id.clone())
            .or_insert_with(|| new_record(document));
        record.status = IngestStatus::Pending;
        record.metadata = document.metadata.clone();
        record.error = None;
        record.updated_at = now_micros();
    }

    fn set_status(&self, document_id: &str, status: IngestStatus) {
        if let Some(record) = self.ledger_mut().get_mut(document_id) {
            record.status = status;
            record.updated_at = now_micros();
        }
    }

    fn fail(&self, document_id: &str, err: RagError) -> RagError {
        if let Some(record) = self.ledger_mut().get_mut(document_id) {
            record.status = IngestStatus::Failed;
            record.error = Some(err.to_string());
            record.updated_at = now_micros();
        }
        warn!(document_id, error = %err, "ingestion failed");
        err
    }

    // ── per-document locks ──────────────────────────────────────────────

    fn document_lock(&self, document_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.doc_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the map entry once nobody else holds or awaits the lock.
    fn release_document_lock(&self, document_id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.doc_locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(document_id);
        }
    }
}

fn validate_document_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(RagError::validation("document id must not be empty"));
    }
    Ok(())
}

fn new_record(document: &Document) -> IngestedDocumentRecord {
    let now = now_micros();
    IngestedDocumentRecord {
        document_id: document.id.clone(),
        status: IngestStatus::Pending,
        node_ids: Vec::new(),
        metadata: document.metadata.clone(),
        error: None,
        created_at: now,
        updated_at: now,
    }
}

fn make_node(
    document: &Document,
    position: usize,
    span: Span,
    vector: Vec<f32>,
    created_at: i64,
) -> Node {
    let mut metadata: Metadata = document.metadata.clone();
    metadata.insert("document_id".to_string(), document.id.clone());
    Node {
        id: Uuid::new_v4().to_string(),
        document_id: document.id.clone(),
        hash: content_hash(&span.text),
        text: span.text,
        start: span.start,
        end: span.end,
        position,
        metadata,
        created_at,
        embedding: Some(vector),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedding;
    use crate::splitter::SplitterConfig;
    use crate::store::memory::{InMemoryNodeStore, InMemoryVectorIndex};

    fn pipeline() -> (IngestionPipeline, Arc<InMemoryNodeStore>, Arc<InMemoryVectorIndex>) {
        let nodes = Arc::new(InMemoryNodeStore::new());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let splitter = TextSplitter::new(SplitterConfig {
            chunk_size: 100,
            chunk_overlap: 20,
        })
        .unwrap();
        let p = IngestionPipeline::new(
            splitter,
            Arc::new(MockEmbedding::new(16)),
            nodes.clone(),
            vectors.clone(),
            IngestSettings {
                batch_size: 2,
                ..Default::default()
            },
        );
        (p, nodes, vectors)
    }

    #[tokio::test]
    async fn test_ingest_three_chunk_document() {
        let (p, nodes, vectors) = pipeline();
        let record = p.ingest(Document::new("doc-1", "x".repeat(260))).await.unwrap();

        assert_eq!(record.status, IngestStatus::Completed);
        assert_eq!(record.node_ids.len(), 3);
        assert_eq!(vectors.count_for_document("doc-1"), 3);

        let stored = nodes.list_by_document("doc-1").await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|n| n.document_id == "doc-1"));
        for pair in stored.windows(2) {
            assert!(pair[1].start < pair[0].end, "offsets should overlap");
        }
    }

    #[tokio::test]
    async fn test_empty_document_completes_with_no_nodes() {
        let (p, nodes, _) = pipeline();
        let record = p.ingest(Document::new("empty", "")).await.unwrap();
        assert_eq!(record.status, IngestStatus::Completed);
        assert!(record.node_ids.is_empty());
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_document_id_rejected() {
        let (p, _, _) = pipeline();
        let err = p.ingest(Document::new("  ", "text")).await.unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
        assert!(matches!(p.delete("").await.unwrap_err(), RagError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (p, nodes, vectors) = pipeline();
        p.ingest(Document::new("doc-1", "hello world")).await.unwrap();
        assert_eq!(p.delete("doc-1").await.unwrap(), 1);
        assert_eq!(p.delete("doc-1").await.unwrap(), 0);
        assert_eq!(p.delete("never-existed").await.unwrap(), 0);
        assert!(nodes.is_empty());
        assert!(vectors.is_empty());
        assert!(p.status("doc-1").is_none());
    }

    #[tokio::test]
    async fn test_reingest_replaces_nodes_with_new_ids() {
        let (p, nodes, vectors) = pipeline();
        let first = p.ingest(Document::new("doc-1", "alpha beta")).await.unwrap();
        let second = p.ingest(Document::new("doc-1", "gamma delta")).await.unwrap();

        assert_ne!(first.node_ids, second.node_ids);
        let stored = nodes.list_by_document("doc-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "gamma delta");
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_clears_everything() {
        let (p, nodes, vectors) = pipeline();
        p.ingest_text("a.txt", "first file").await.unwrap();
        p.ingest_text("b.txt", "second file").await.unwrap();
        assert_eq!(p.list().len(), 2);

        assert_eq!(p.wipe().await.unwrap(), 2);
        assert!(p.list().is_empty());
        assert!(nodes.is_empty());
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_text_records_file_name() {
        let (p, _, _) = pipeline();
        let record = p.ingest_text("notes.md", "some notes").await.unwrap();
        assert_eq!(record.metadata.get(FILE_NAME_KEY).map(String::as_str), Some("notes.md"));
        assert!(Uuid::parse_str(&record.document_id).is_ok());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_ledger_from_store() {
        let (p, nodes, vectors) = pipeline();
        p.ingest(Document::new("doc-1", "persisted text")).await.unwrap();

        let splitter = TextSplitter::new(SplitterConfig::default()).unwrap();
        let fresh = IngestionPipeline::new(
            splitter,
            Arc::new(MockEmbedding::new(16)),
            nodes,
            vectors,
            IngestSettings::default(),
        );
        assert!(fresh.list().is_empty());
        assert_eq!(fresh.restore().await.unwrap(), 1);
        let record = fresh.status("doc-1").unwrap();
        assert_eq!(record.status, IngestStatus::Completed);
        assert_eq!(record.node_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_many_preserves_order() {
        let (p, _, _) = pipeline();
        let docs = (0..5)
            .map(|i| Document::new(format!("doc-{}", i), format!("document number {}", i)))
            .collect();
        let results = p.ingest_many(docs).await;
        let ids: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().document_id)
            .collect();
        assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2", "doc-3", "doc-4"]);
    }
}
