//! End-to-end tests for the ingestion pipeline and chat engine.
//!
//! Backends are the in-memory stores and mock services, wrapped in test
//! doubles that fail, stall, or count calls on demand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use private_rag_core::cancel::CancellationToken;
use private_rag_core::chat::{ChatEngine, ChatRequest, ChatSettings};
use private_rag_core::embedding::{EmbeddingService, MockEmbedding};
use private_rag_core::ingest::{IngestSettings, IngestionPipeline};
use private_rag_core::llm::{DeltaStream, LlmService, MockLlm, Prompt};
use private_rag_core::models::{
    AnswerEvent, ChatMessage, Document, IngestStatus, Metadata, Node, SearchFilter,
};
use private_rag_core::splitter::{SplitterConfig, TextSplitter};
use private_rag_core::store::memory::{InMemoryNodeStore, InMemoryVectorIndex};
use private_rag_core::store::{NodeStore, VectorIndex, VectorMatch};
use private_rag_core::{Backend, RagError, Result};

// ─── Test doubles ───────────────────────────────────────────────────

/// Vector index whose writes can be switched to fail.
#[derive(Default)]
struct FlakyVectorIndex {
    inner: InMemoryVectorIndex,
    fail_upserts_after: Option<usize>,
    upserts: AtomicUsize,
    fail_deletes: AtomicBool,
    fail_search: bool,
}

#[async_trait]
impl VectorIndex for FlakyVectorIndex {
    async fn upsert(
        &self,
        node_id: &str,
        document_id: &str,
        vector: &[f32],
        metadata: &Metadata,
    ) -> Result<()> {
        let n = self.upserts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_upserts_after {
            if n >= limit {
                return Err(RagError::backend(Backend::VectorIndex, "disk full"));
            }
        }
        self.inner.upsert(node_id, document_id, vector, metadata).await
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RagError::backend(Backend::VectorIndex, "connection reset"));
        }
        self.inner.delete(node_id).await
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.inner.delete_by_document(document_id).await
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>> {
        if self.fail_search {
            return Err(RagError::backend(Backend::VectorIndex, "unreachable"));
        }
        self.inner.search(vector, top_k, filter).await
    }
}

/// Vector index whose upserts take `delay` before reaching the inner index.
struct SlowVectorIndex {
    inner: InMemoryVectorIndex,
    delay: Duration,
}

impl SlowVectorIndex {
    fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryVectorIndex::new(),
            delay,
        }
    }
}

#[async_trait]
impl VectorIndex for SlowVectorIndex {
    async fn upsert(
        &self,
        node_id: &str,
        document_id: &str,
        vector: &[f32],
        metadata: &Metadata,
    ) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(node_id, document_id, vector, metadata).await
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        self.inner.delete(node_id).await
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.inner.delete_by_document(document_id).await
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>> {
        self.inner.search(vector, top_k, filter).await
    }
}

/// Embedding service that fails or sleeps.
struct BrokenEmbedding {
    delay: Option<Duration>,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingService for BrokenEmbedding {
    fn model_name(&self) -> &str {
        "broken"
    }

    fn dims(&self) -> usize {
        8
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.delay {
            Some(d) => {
                tokio::time::sleep(d).await;
                Ok(texts.iter().map(|_| vec![0.5; 8]).collect())
            }
            None => Err(RagError::backend(Backend::Embedding, "model not loaded")),
        }
    }
}

/// Embedding service that records how many calls overlap.
struct OverlapCounter {
    inner: MockEmbedding,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl EmbeddingService for OverlapCounter {
    fn model_name(&self) -> &str {
        "overlap-counter"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let out = self.inner.embed(texts).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

/// LLM that streams forever until cancelled, counting produced deltas.
#[derive(Default)]
struct EndlessLlm {
    produced: Arc<AtomicUsize>,
}

#[async_trait]
impl LlmService for EndlessLlm {
    fn model_name(&self) -> &str {
        "endless"
    }

    async fn complete(&self, _prompt: &Prompt, _cancel: &CancellationToken) -> Result<String> {
        Ok(String::new())
    }

    async fn stream_complete(
        &self,
        _prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        let produced = self.produced.clone();
        let cancel = cancel.clone();
        let s = stream::unfold(0usize, move |i| {
            let produced = produced.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                produced.fetch_add(1, Ordering::SeqCst);
                Some((Ok(format!("tok{} ", i)), i + 1))
            }
        });
        Ok(Box::pin(s))
    }
}

/// LLM that emits a few deltas then either errors or stalls.
struct FaultyLlm {
    stall: bool,
}

#[async_trait]
impl LlmService for FaultyLlm {
    fn model_name(&self) -> &str {
        "faulty"
    }

    async fn complete(&self, _prompt: &Prompt, _cancel: &CancellationToken) -> Result<String> {
        Err(RagError::backend(Backend::Llm, "overloaded"))
    }

    async fn stream_complete(
        &self,
        _prompt: &Prompt,
        _cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        let head = stream::iter(vec![Ok("partial ".to_string()), Ok("answer ".to_string())]);
        if self.stall {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            let tail = stream::iter(vec![Err(RagError::backend(Backend::Llm, "connection dropped"))]);
            Ok(Box::pin(head.chain(tail)))
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn splitter(size: usize, overlap: usize) -> TextSplitter {
    TextSplitter::new(SplitterConfig {
        chunk_size: size,
        chunk_overlap: overlap,
    })
    .unwrap()
}

fn pipeline_with(
    embedder: Arc<dyn EmbeddingService>,
    nodes: Arc<dyn NodeStore>,
    vectors: Arc<dyn VectorIndex>,
) -> IngestionPipeline {
    IngestionPipeline::new(
        splitter(100, 20),
        embedder,
        nodes,
        vectors,
        IngestSettings {
            batch_size: 8,
            concurrency: 4,
            timeout: Some(Duration::from_millis(500)),
        },
    )
}

struct Harness {
    nodes: Arc<InMemoryNodeStore>,
    vectors: Arc<InMemoryVectorIndex>,
    pipeline: IngestionPipeline,
    engine: ChatEngine,
}

fn harness_with_llm(llm: Arc<dyn LlmService>, settings: ChatSettings) -> Harness {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let embedder: Arc<dyn EmbeddingService> = Arc::new(MockEmbedding::new(64));
    let pipeline = pipeline_with(embedder.clone(), nodes.clone(), vectors.clone());
    let engine = ChatEngine::new(embedder, nodes.clone(), vectors.clone(), llm, settings);
    Harness {
        nodes,
        vectors,
        pipeline,
        engine,
    }
}

fn harness() -> Harness {
    harness_with_llm(Arc::new(MockLlm::new()), ChatSettings::default())
}

async fn ingest_corpus(h: &Harness) {
    let docs = vec![
        Document::new("rust", "Rust is a systems programming language focused on safety."),
        Document::new("python", "Python is a dynamic language popular for scripting."),
        Document::new("sqlite", "SQLite is an embedded database engine stored in one file."),
    ];
    for r in h.pipeline.ingest_many(docs).await {
        r.unwrap();
    }
}

// ─── Ingestion ──────────────────────────────────────────────────────

#[tokio::test]
async fn ingest_then_delete_leaves_no_records() {
    let h = harness();
    let text = "lorem ipsum dolor sit amet ".repeat(40);
    let record = h.pipeline.ingest(Document::new("doc-a", text)).await.unwrap();
    assert!(record.node_ids.len() > 1);

    h.pipeline.delete("doc-a").await.unwrap();

    assert!(h.nodes.list_by_document("doc-a").await.unwrap().is_empty());
    assert_eq!(h.vectors.count_for_document("doc-a"), 0);
    for id in &record.node_ids {
        assert!(h.nodes.get(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn three_chunk_document_scenario() {
    let h = harness();
    let record = h
        .pipeline
        .ingest(Document::new("doc-3", "a".repeat(260)))
        .await
        .unwrap();

    let nodes = h.nodes.list_by_document("doc-3").await.unwrap();
    assert_eq!(nodes.len(), 3);
    assert_eq!(record.node_ids.len(), 3);
    assert_eq!(h.vectors.count_for_document("doc-3"), 3);
    assert!(nodes.iter().all(|n| n.document_id == "doc-3"));
    assert_eq!(nodes[0].start, 0);
    assert_eq!(nodes[2].end, 260);
    assert!(nodes[1].start < nodes[0].end);
    assert!(nodes[2].start < nodes[1].end);
}

#[tokio::test]
async fn vector_write_failure_rolls_back_node_store() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(FlakyVectorIndex {
        fail_upserts_after: Some(1),
        ..Default::default()
    });
    let pipeline = pipeline_with(Arc::new(MockEmbedding::new(16)), nodes.clone(), vectors.clone());

    let err = pipeline
        .ingest(Document::new("doc-r", "b".repeat(260)))
        .await
        .unwrap_err();

    assert_eq!(err.failed_backend(), Some(Backend::VectorIndex));
    assert!(nodes.list_by_document("doc-r").await.unwrap().is_empty());
    assert_eq!(vectors.inner.count_for_document("doc-r"), 0);

    let record = pipeline.status("doc-r").unwrap();
    assert_eq!(record.status, IngestStatus::Failed);
    assert!(record.error.unwrap().contains("disk full"));
}

#[tokio::test]
async fn failed_rollback_is_a_consistency_error() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(FlakyVectorIndex {
        fail_upserts_after: Some(1),
        fail_deletes: AtomicBool::new(true),
        ..Default::default()
    });
    let pipeline = pipeline_with(Arc::new(MockEmbedding::new(16)), nodes, vectors);

    let err = pipeline
        .ingest(Document::new("doc-c", "c".repeat(260)))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Consistency(_)), "got {err:?}");
}

#[tokio::test]
async fn embedding_failure_writes_nothing() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let embedder = Arc::new(BrokenEmbedding {
        delay: None,
        calls: AtomicUsize::new(0),
    });
    let pipeline = pipeline_with(embedder, nodes.clone(), vectors.clone());

    let err = pipeline
        .ingest(Document::new("doc-e", "some text"))
        .await
        .unwrap_err();
    assert_eq!(err.failed_backend(), Some(Backend::Embedding));
    assert!(nodes.is_empty());
    assert!(vectors.is_empty());
}

#[tokio::test]
async fn embedding_timeout_fails_ingestion() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let embedder = Arc::new(BrokenEmbedding {
        delay: Some(Duration::from_secs(5)),
        calls: AtomicUsize::new(0),
    });
    let pipeline = pipeline_with(embedder, nodes.clone(), vectors);

    let err = pipeline
        .ingest(Document::new("doc-t", "slow text"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert!(nodes.is_empty());
}

#[tokio::test]
async fn stalled_vector_write_times_out_and_rolls_back() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(SlowVectorIndex::new(Duration::from_secs(5)));
    let pipeline = IngestionPipeline::new(
        splitter(100, 20),
        Arc::new(MockEmbedding::new(16)),
        nodes.clone(),
        vectors.clone(),
        IngestSettings {
            batch_size: 8,
            concurrency: 1,
            timeout: Some(Duration::from_millis(50)),
        },
    );

    let err = pipeline
        .ingest(Document::new("doc-s", "d".repeat(260)))
        .await
        .unwrap_err();

    assert_eq!(err.failed_backend(), Some(Backend::VectorIndex));
    assert!(err.to_string().contains("timed out"));
    assert!(nodes.list_by_document("doc-s").await.unwrap().is_empty());
    assert_eq!(vectors.inner.count_for_document("doc-s"), 0);
    assert_eq!(pipeline.status("doc-s").unwrap().status, IngestStatus::Failed);
}

#[tokio::test]
async fn dropped_ingest_still_finishes_its_write() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(SlowVectorIndex::new(Duration::from_millis(200)));
    let pipeline = pipeline_with(Arc::new(MockEmbedding::new(16)), nodes.clone(), vectors.clone());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        pipeline.ingest(Document::new("doc-d", "e".repeat(260))),
    )
    .await;
    assert!(abandoned.is_err());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let record = loop {
        let record = pipeline.status("doc-d");
        if let Some(r) = record.as_ref() {
            if matches!(r.status, IngestStatus::Completed | IngestStatus::Failed) {
                break r.clone();
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "stuck at {:?}", record);
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(record.status, IngestStatus::Completed);
    let stored = nodes.list_by_document("doc-d").await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(record.node_ids.len(), 3);
    assert_eq!(vectors.inner.count_for_document("doc-d"), 3);
}

#[tokio::test]
async fn failed_reingest_keeps_previous_generation() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(FlakyVectorIndex {
        fail_upserts_after: Some(1),
        ..Default::default()
    });
    let pipeline = pipeline_with(Arc::new(MockEmbedding::new(16)), nodes.clone(), vectors.clone());

    let first = pipeline.ingest(Document::new("doc-g", "short")).await.unwrap();
    assert!(pipeline
        .ingest(Document::new("doc-g", "replacement text"))
        .await
        .is_err());

    let stored = nodes.list_by_document("doc-g").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, first.node_ids[0]);
    assert_eq!(vectors.inner.count_for_document("doc-g"), 1);
}

#[tokio::test]
async fn same_document_ingestion_is_serialized() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let counter = Arc::new(OverlapCounter {
        inner: MockEmbedding::new(16),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let pipeline = Arc::new(pipeline_with(counter.clone(), nodes.clone(), vectors.clone()));

    let mut handles = Vec::new();
    for i in 0..4 {
        let p = pipeline.clone();
        handles.push(tokio::spawn(async move {
            p.ingest(Document::new("same", format!("version {}", i))).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(counter.peak.load(Ordering::SeqCst), 1);
    // Only the last generation survives.
    assert_eq!(nodes.list_by_document("same").await.unwrap().len(), 1);
    assert_eq!(vectors.len(), 1);
}

#[tokio::test]
async fn different_documents_ingest_concurrently() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let counter = Arc::new(OverlapCounter {
        inner: MockEmbedding::new(16),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let pipeline = pipeline_with(counter.clone(), nodes.clone(), vectors.clone());

    let docs = (0..4)
        .map(|i| Document::new(format!("doc-{}", i), format!("text number {}", i)))
        .collect();
    let results = pipeline.ingest_many(docs).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(counter.peak.load(Ordering::SeqCst) > 1);
    assert_eq!(nodes.len(), 4);
    assert_eq!(vectors.len(), 4);
}

// ─── Retrieval ──────────────────────────────────────────────────────

#[tokio::test]
async fn empty_index_returns_empty_result() {
    let h = harness();
    let result = h
        .engine
        .retrieve("anything at all", 5, &SearchFilter::default())
        .await
        .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn retrieve_respects_top_k_and_ordering() {
    let h = harness();
    ingest_corpus(&h).await;

    for k in 1..=4 {
        let result = h
            .engine
            .retrieve("systems programming safety", k, &SearchFilter::default())
            .await
            .unwrap();
        assert!(result.len() <= k);
        assert!(result
            .nodes
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    let best = h
        .engine
        .retrieve("Rust systems programming", 1, &SearchFilter::default())
        .await
        .unwrap();
    assert_eq!(best.nodes[0].node.document_id, "rust");
}

#[tokio::test]
async fn equal_scores_prefer_newest_document() {
    // The index orders ties by random node id, so repeat to cover both orders.
    for _ in 0..8 {
        let h = harness();
        let text = "identical paragraph about vector search";
        h.pipeline.ingest(Document::new("older", text)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        h.pipeline.ingest(Document::new("newer", text)).await.unwrap();

        let result = h
            .engine
            .retrieve(text, 1, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.nodes[0].node.document_id, "newer");
    }
}

#[tokio::test]
async fn retrieve_rejects_zero_top_k() {
    let h = harness();
    let err = h
        .engine
        .retrieve("q", 0, &SearchFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));
}

#[tokio::test]
async fn retrieve_filter_restricts_documents() {
    let h = harness();
    ingest_corpus(&h).await;
    let result = h
        .engine
        .retrieve("language", 10, &SearchFilter::documents(vec!["python".into()]))
        .await
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.nodes[0].node.document_id, "python");
}

#[tokio::test]
async fn retrieve_surfaces_index_failure() {
    let nodes = Arc::new(InMemoryNodeStore::new());
    let vectors = Arc::new(FlakyVectorIndex {
        fail_search: true,
        ..Default::default()
    });
    let engine = ChatEngine::new(
        Arc::new(MockEmbedding::new(16)),
        nodes,
        vectors,
        Arc::new(MockLlm::new()),
        ChatSettings::default(),
    );
    let err = engine
        .retrieve("q", 3, &SearchFilter::default())
        .await
        .unwrap_err();
    assert_eq!(err.failed_backend(), Some(Backend::VectorIndex));
}

#[tokio::test]
async fn retrieve_skips_tombstoned_nodes() {
    let h = harness();
    ingest_corpus(&h).await;
    let orphan = h.nodes.list_by_document("rust").await.unwrap()[0].id.clone();
    h.nodes.delete(&orphan).await.unwrap();

    let result = h
        .engine
        .retrieve("Rust", 10, &SearchFilter::default())
        .await
        .unwrap();
    assert!(result.nodes.iter().all(|n| n.node.id != orphan));
}

#[tokio::test]
async fn chunks_include_neighbours() {
    let h = harness();
    let text = (0..6)
        .map(|i| format!("paragraph {} {}", i, "word ".repeat(15)))
        .collect::<Vec<_>>()
        .join("\n");
    h.pipeline.ingest(Document::new("long", text)).await.unwrap();
    let all: Vec<Node> = h.nodes.list_by_document("long").await.unwrap();
    assert!(all.len() >= 3);

    let chunks = h
        .engine
        .chunks("paragraph", all.len(), &SearchFilter::default(), 1)
        .await
        .unwrap();
    for chunk in chunks {
        let pos = chunk.node.position;
        assert_eq!(chunk.previous_texts.len(), if pos == 0 { 0 } else { 1 });
        assert_eq!(chunk.next_texts.len(), if pos + 1 == all.len() { 0 } else { 1 });
    }
}

// ─── Generation ─────────────────────────────────────────────────────

#[tokio::test]
async fn chat_returns_answer_with_citations() {
    let h = harness();
    ingest_corpus(&h).await;

    let answer = h
        .engine
        .chat(
            ChatRequest::query("What is SQLite?"),
            &CancellationToken::never(),
        )
        .await
        .unwrap();
    assert!(answer.text.starts_with("You asked: What is SQLite?"));
    assert!(!answer.citations.is_empty());
    for id in &answer.citations {
        assert!(h.nodes.get(id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn chat_without_context_has_no_citations() {
    let h = harness();
    ingest_corpus(&h).await;
    let answer = h
        .engine
        .chat(
            ChatRequest::query("hello").without_context(),
            &CancellationToken::never(),
        )
        .await
        .unwrap();
    assert_eq!(answer.text, "You asked: hello.");
    assert!(answer.citations.is_empty());
}

#[tokio::test]
async fn chat_requires_trailing_user_message() {
    let h = harness();
    let request = ChatRequest::new(vec![
        ChatMessage::user("hi"),
        ChatMessage::assistant("hello"),
    ]);
    let err = h
        .engine
        .chat(request, &CancellationToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));
}

#[tokio::test]
async fn stream_ends_with_done_and_matches_whole_answer() {
    let h = harness();
    ingest_corpus(&h).await;
    let cancel = CancellationToken::never();

    let whole = h
        .engine
        .chat(ChatRequest::query("Tell me about Python"), &cancel)
        .await
        .unwrap();
    let events: Vec<AnswerEvent> = h
        .engine
        .chat_stream(ChatRequest::query("Tell me about Python"), cancel.clone())
        .await
        .unwrap()
        .collect()
        .await;

    let (last, deltas) = events.split_last().unwrap();
    let text: String = deltas
        .iter()
        .map(|e| match e {
            AnswerEvent::Delta { text } => text.as_str(),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(text, whole.text);
    assert_eq!(
        last,
        &AnswerEvent::Done {
            citations: whole.citations
        }
    );
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn cancelling_stream_stops_generation() {
    let llm = Arc::new(EndlessLlm::default());
    let produced = llm.produced.clone();
    let h = harness_with_llm(llm, ChatSettings::default());
    let (token, handle) = CancellationToken::new();

    let mut s = h
        .engine
        .chat_stream(ChatRequest::query("go").without_context(), token.clone())
        .await
        .unwrap();
    for _ in 0..3 {
        assert!(matches!(s.next().await, Some(AnswerEvent::Delta { .. })));
    }
    handle.cancel();

    assert!(matches!(s.next().await, Some(AnswerEvent::Cancelled { .. })));
    assert!(s.next().await.is_none());

    let after = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn dropping_stream_cancels_generation() {
    let llm = Arc::new(EndlessLlm::default());
    let produced = llm.produced.clone();
    let h = harness_with_llm(llm, ChatSettings::default());
    let token = CancellationToken::never();

    let mut s = h
        .engine
        .chat_stream(ChatRequest::query("go").without_context(), token.clone())
        .await
        .unwrap();
    s.next().await;
    drop(s);

    assert!(token.is_cancelled());
    let after = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(produced.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn mid_stream_error_ends_with_failed_terminal() {
    let h = harness_with_llm(Arc::new(FaultyLlm { stall: false }), ChatSettings::default());
    let events: Vec<AnswerEvent> = h
        .engine
        .chat_stream(
            ChatRequest::query("q").without_context(),
            CancellationToken::never(),
        )
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    match events.last() {
        Some(AnswerEvent::Failed { error, .. }) => assert!(error.contains("connection dropped")),
        other => panic!("expected failure terminal, got {other:?}"),
    }
}

#[tokio::test]
async fn stalled_stream_times_out_with_failed_terminal() {
    let settings = ChatSettings {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let h = harness_with_llm(Arc::new(FaultyLlm { stall: true }), settings);
    let events: Vec<AnswerEvent> = h
        .engine
        .chat_stream(
            ChatRequest::query("q").without_context(),
            CancellationToken::never(),
        )
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], AnswerEvent::Delta { .. }));
    assert!(matches!(events[2], AnswerEvent::Failed { .. }));
}

#[tokio::test]
async fn whole_answer_failure_names_llm_backend() {
    let h = harness_with_llm(Arc::new(FaultyLlm { stall: false }), ChatSettings::default());
    let err = h
        .engine
        .chat(
            ChatRequest::query("q").without_context(),
            &CancellationToken::never(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.failed_backend(), Some(Backend::Llm));
}
