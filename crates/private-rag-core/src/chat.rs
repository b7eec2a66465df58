//! Retrieval-and-generation pipeline.
//!
//! The chat engine is read-only with respect to both stores. A request
//! runs in three steps:
//!
//! 1. [`ChatEngine::retrieve`]: embed the query, search the vector index,
//!    resolve hits through the node store.
//! 2. [`assemble_context`]: pick nodes greedily under a token budget,
//!    trimming history first when the top node does not fit.
//! 3. [`ChatEngine::generate`] / [`ChatEngine::generate_stream`]: call the
//!    LLM with the assembled prompt.
//!
//! Streams end with exactly one terminal [`AnswerEvent`]. Dropping a stream
//! before its terminal event cancels the underlying LLM call.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, warn};

use crate::cancel::{CancelOnDrop, CancellationToken};
use crate::embedding::EmbeddingService;
use crate::error::{with_timeout, Backend, RagError, Result};
use crate::llm::{DeltaStream, LlmService, Prompt, CONTEXT_MARKER};
use crate::models::{
    Answer, AnswerEvent, ChatContext, ChatMessage, ContextChunk, Node, RetrievalResult, Role,
    ScoredNode, SearchFilter,
};
use crate::splitter::estimate_tokens;
use crate::store::{NodeStore, VectorIndex, VectorMatch};

/// A lazily generated answer.
pub type AnswerStream = Pin<Box<dyn Stream<Item = AnswerEvent> + Send>>;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the question using \
the provided context. If the context does not contain the answer, say that you do not know.";

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub top_k: usize,
    /// Drop results scoring below this value.
    pub similarity_threshold: Option<f32>,
    /// Token budget shared by context nodes and history.
    pub max_context_tokens: usize,
    pub system_prompt: String,
    /// Deadline for each backend call, and for each streamed delta.
    pub timeout: Option<Duration>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            top_k: 4,
            similarity_threshold: None,
            max_context_tokens: 3000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// One conversational request.
///
/// The last message is the query; earlier user/assistant messages are
/// history. A system message replaces the configured system prompt.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub use_context: bool,
    pub filter: SearchFilter,
    /// Overrides the configured `top_k`.
    pub top_k: Option<usize>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            use_context: true,
            filter: SearchFilter::default(),
            top_k: None,
        }
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    pub fn without_context(mut self) -> Self {
        self.use_context = false;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }
}

pub struct ChatEngine {
    embedder: Arc<dyn EmbeddingService>,
    nodes: Arc<dyn NodeStore>,
    vectors: Arc<dyn VectorIndex>,
    llm: Arc<dyn LlmService>,
    settings: ChatSettings,
}

impl ChatEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        nodes: Arc<dyn NodeStore>,
        vectors: Arc<dyn VectorIndex>,
        llm: Arc<dyn LlmService>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            embedder,
            nodes,
            vectors,
            llm,
            settings,
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn llm_model(&self) -> &str {
        self.llm.model_name()
    }

    /// The `top_k` most similar nodes, best first.
    ///
    /// Equal scores are ordered most recently ingested first. Ids the index
    /// returns but the node store no longer has are skipped.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<RetrievalResult> {
        if top_k == 0 {
            return Err(RagError::validation("top_k must be a positive integer"));
        }
        if query.trim().is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }
        let timeout = self.settings.timeout;

        let vector = self.embed_query(query).await?;
        let matches = self.search_with_ties(&vector, top_k, filter).await?;

        let mut nodes = Vec::with_capacity(matches.len());
        for m in matches {
            if let Some(min) = self.settings.similarity_threshold {
                if m.score < min {
                    continue;
                }
            }
            match with_timeout(Backend::NodeStore, timeout, self.nodes.get(&m.node_id)).await? {
                Some(node) => nodes.push(ScoredNode {
                    node,
                    score: m.score,
                }),
                None => warn!(node_id = %m.node_id, "vector index returned unknown node"),
            }
        }

        sort_scored(&mut nodes);
        nodes.truncate(top_k);
        debug!(hits = nodes.len(), top_k, "retrieved nodes");
        Ok(RetrievalResult { nodes })
    }

    /// Search the index for at least `top_k` matches, widening the request
    /// until every match tied with the `top_k`-th score is included.
    ///
    /// Indexes break score ties arbitrarily, so cutting at `top_k` there could
    /// drop a newer node that [`sort_scored`] would have kept.
    async fn search_with_ties(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>> {
        let mut limit = top_k;
        loop {
            let matches = with_timeout(
                Backend::VectorIndex,
                self.settings.timeout,
                self.vectors.search(vector, limit, filter),
            )
            .await?;
            if matches.len() < limit || matches[limit - 1].score < matches[top_k - 1].score {
                return Ok(matches);
            }
            let wider = limit.saturating_mul(2);
            if wider == limit {
                return Ok(matches);
            }
            debug!(limit = wider, "widening search to cover tied scores");
            limit = wider;
        }
    }

    /// Whole-answer generation.
    pub async fn generate(&self, ctx: &ChatContext, cancel: &CancellationToken) -> Result<Answer> {
        cancel.check()?;
        let prompt = self.build_prompt(ctx);
        let text = with_timeout(
            Backend::Llm,
            self.settings.timeout,
            self.llm.complete(&prompt, cancel),
        )
        .await?;
        Ok(Answer {
            text,
            citations: ctx.citations(),
        })
    }

    /// Streamed generation.
    ///
    /// Nothing is requested from the LLM until the stream is first polled.
    pub fn generate_stream(&self, ctx: &ChatContext, cancel: CancellationToken) -> AnswerStream {
        let generation = Generation {
            llm: self.llm.clone(),
            prompt: self.build_prompt(ctx),
            guard: CancelOnDrop::new(cancel.clone()),
            cancel,
            timeout: self.settings.timeout,
            citations: ctx.citations(),
            deltas: None,
            finished: false,
        };
        Box::pin(stream::unfold(generation, |mut g| async move {
            let event = g.next_event().await?;
            Some((event, g))
        }))
    }

    /// Retrieve, assemble, and answer in one call.
    pub async fn chat(&self, request: ChatRequest, cancel: &CancellationToken) -> Result<Answer> {
        let ctx = self.prepare(request).await?;
        self.generate(&ctx, cancel).await
    }

    /// Like [`chat`](Self::chat) but streamed.
    ///
    /// Validation and retrieval errors are returned before any stream exists.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<AnswerStream> {
        let ctx = self.prepare(request).await?;
        Ok(self.generate_stream(&ctx, cancel))
    }

    /// Single-prompt completion.
    pub async fn complete(
        &self,
        prompt: &str,
        use_context: bool,
        filter: SearchFilter,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let mut request = ChatRequest::query(prompt).with_filter(filter);
        request.use_context = use_context;
        self.chat(request, cancel).await
    }

    /// Relevant chunks with up to `prev_next` neighbouring chunk texts on
    /// each side.
    pub async fn chunks(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
        prev_next: usize,
    ) -> Result<Vec<ContextChunk>> {
        let result = self.retrieve(query, limit, filter).await?;
        let mut siblings: HashMap<String, Vec<Node>> = HashMap::new();
        let mut out = Vec::with_capacity(result.len());

        for scored in result.nodes {
            let mut chunk = ContextChunk {
                previous_texts: Vec::new(),
                next_texts: Vec::new(),
                score: scored.score,
                node: scored.node,
            };
            if prev_next > 0 {
                let doc_id = chunk.node.document_id.clone();
                if !siblings.contains_key(&doc_id) {
                    let listed = with_timeout(
                        Backend::NodeStore,
                        self.settings.timeout,
                        self.nodes.list_by_document(&doc_id),
                    )
                    .await?;
                    siblings.insert(doc_id.clone(), listed);
                }
                let doc_nodes = siblings.get(&doc_id).map(Vec::as_slice).unwrap_or_default();
                if let Some(idx) = doc_nodes.iter().position(|n| n.id == chunk.node.id) {
                    let from = idx.saturating_sub(prev_next);
                    let to = (idx + 1 + prev_next).min(doc_nodes.len());
                    chunk.previous_texts = doc_nodes[from..idx].iter().map(|n| n.text.clone()).collect();
                    chunk.next_texts = doc_nodes[idx + 1..to].iter().map(|n| n.text.clone()).collect();
                }
            }
            out.push(chunk);
        }
        Ok(out)
    }

    /// Embeddings for arbitrary texts.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(RagError::validation("input must contain at least one text"));
        }
        with_timeout(
            Backend::Embedding,
            self.settings.timeout,
            self.embedder.embed(texts),
        )
        .await
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_name()
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = with_timeout(
            Backend::Embedding,
            self.settings.timeout,
            self.embedder.embed(&[query.to_string()]),
        )
        .await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::backend(Backend::Embedding, "no vector returned for query"))
    }

    async fn prepare(&self, request: ChatRequest) -> Result<ChatContext> {
        let ChatRequest {
            mut messages,
            use_context,
            filter,
            top_k,
        } = request;

        let last = messages
            .pop()
            .ok_or_else(|| RagError::validation("messages must not be empty"))?;
        if last.role != Role::User {
            return Err(RagError::validation("last message must come from the user"));
        }
        if last.content.trim().is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }

        let system_prompt = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let history: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();

        let result = if use_context {
            let k = top_k.unwrap_or(self.settings.top_k);
            self.retrieve(&last.content, k, &filter).await?
        } else {
            RetrievalResult::default()
        };

        let mut ctx = assemble_context(
            result,
            history,
            &last.content,
            self.settings.max_context_tokens,
        );
        ctx.system_prompt = system_prompt;
        Ok(ctx)
    }

    fn build_prompt(&self, ctx: &ChatContext) -> Prompt {
        let mut system = ctx
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.settings.system_prompt.clone());

        if !ctx.nodes.is_empty() {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(CONTEXT_MARKER);
            system.push('\n');
            for (i, scored) in ctx.nodes.iter().enumerate() {
                system.push_str(&format!("[{}] {}\n", i + 1, scored.node.text.trim()));
            }
        }

        let mut messages = Vec::with_capacity(ctx.history.len() + 2);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.extend(ctx.history.iter().cloned());
        messages.push(ChatMessage::user(ctx.query.clone()));
        Prompt::new(messages)
    }
}

/// Fit retrieved nodes and history into `max_tokens`.
///
/// Nodes are taken best first and never cut. The query itself is not
/// counted. When the best node does not fit next to the history, history
/// is dropped oldest first; if the node still does not fit it is kept
/// anyway.
pub fn assemble_context(
    result: RetrievalResult,
    mut history: Vec<ChatMessage>,
    query: &str,
    max_tokens: usize,
) -> ChatContext {
    let mut history_tokens: usize = history.iter().map(|m| estimate_tokens(&m.content)).sum();
    let mut trimmed_turns = 0;
    let mut nodes = Vec::new();
    let mut used = 0;

    for (i, scored) in result.nodes.into_iter().enumerate() {
        let cost = estimate_tokens(&scored.node.text);
        if i == 0 {
            while history_tokens + cost > max_tokens && !history.is_empty() {
                let dropped = history.remove(0);
                history_tokens -= estimate_tokens(&dropped.content);
                trimmed_turns += 1;
            }
        } else if history_tokens + used + cost > max_tokens {
            break;
        }
        used += cost;
        nodes.push(scored);
    }

    if trimmed_turns > 0 {
        debug!(trimmed_turns, "trimmed history to fit context budget");
    }
    ChatContext {
        nodes,
        history,
        query: query.to_string(),
        system_prompt: None,
        trimmed_turns,
    }
}

/// Score desc, then newest first, then document id and position.
fn sort_scored(nodes: &mut [ScoredNode]) {
    nodes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.node.created_at.cmp(&a.node.created_at))
            .then_with(|| a.node.document_id.cmp(&b.node.document_id))
            .then_with(|| a.node.position.cmp(&b.node.position))
    });
}

/// State behind an [`AnswerStream`].
struct Generation {
    llm: Arc<dyn LlmService>,
    prompt: Prompt,
    cancel: CancellationToken,
    guard: CancelOnDrop,
    timeout: Option<Duration>,
    citations: Vec<String>,
    deltas: Option<DeltaStream>,
    finished: bool,
}

impl Generation {
    async fn next_event(&mut self) -> Option<AnswerEvent> {
        if self.finished {
            return None;
        }
        let event = self.step().await;
        if event.is_terminal() {
            self.finished = true;
            // Release the LLM stream before reporting the end.
            self.deltas = None;
            self.guard.disarm();
        }
        Some(event)
    }

    async fn step(&mut self) -> AnswerEvent {
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        if self.deltas.is_none() {
            let opened = with_timeout(
                Backend::Llm,
                self.timeout,
                self.llm.stream_complete(&self.prompt, &self.cancel),
            )
            .await;
            match opened {
                Ok(s) => self.deltas = Some(s),
                Err(e) => return self.failed(e),
            }
        }

        let Some(deltas) = self.deltas.as_mut() else {
            return self.cancelled();
        };
        let next = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, deltas.next()).await.map_err(|_| {
                RagError::backend(
                    Backend::Llm,
                    format!("no output within {} ms", limit.as_millis()),
                )
            }),
            None => Ok(deltas.next().await),
        };

        match next {
            _ if self.cancel.is_cancelled() => self.cancelled(),
            Ok(Some(Ok(text))) => AnswerEvent::Delta { text },
            Ok(Some(Err(e))) => self.failed(e),
            Ok(None) => AnswerEvent::Done {
                citations: self.citations.clone(),
            },
            Err(e) => self.failed(e),
        }
    }

    fn cancelled(&self) -> AnswerEvent {
        debug!("answer stream cancelled");
        AnswerEvent::Cancelled {
            citations: self.citations.clone(),
        }
    }

    fn failed(&self, err: RagError) -> AnswerEvent {
        if err.is_cancelled() {
            return self.cancelled();
        }
        warn!(error = %err, "answer stream failed");
        AnswerEvent::Failed {
            error: err.to_string(),
            citations: self.citations.clone(),
        }
    }
}
