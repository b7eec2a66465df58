//! Core data models that flow through the ingestion and chat pipelines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Free-form key-value metadata (file name, source path, ...).
pub type Metadata = BTreeMap<String, String>;

/// A source unit handed to the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A chunk of a document: the unit of embedding and retrieval.
///
/// `text` is always `document.text[start..end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Chunk index within the document.
    pub position: usize,
    /// SHA-256 of `text`.
    pub hash: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Ingestion time in microseconds since the epoch.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Ingestion state of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Embedding,
    Persisting,
    Completed,
    Failed,
}

impl IngestStatus {
    /// True once the document can no longer change state on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, IngestStatus::Completed | IngestStatus::Failed)
    }
}

/// Ledger entry tying a document to the nodes produced from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedDocumentRecord {
    pub document_id: String,
    pub status: IngestStatus,
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A node paired with its similarity to a query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}

/// Nodes ordered by descending score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub nodes: Vec<ScoredNode>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.node.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a single generation call sees.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub nodes: Vec<ScoredNode>,
    pub history: Vec<ChatMessage>,
    pub query: String,
    /// Replaces the configured system prompt for this call.
    pub system_prompt: Option<String>,
    /// Number of history turns dropped to fit the budget.
    pub trimmed_turns: usize,
}

impl ChatContext {
    pub fn citations(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.node.id.clone()).collect()
    }
}

/// A complete, grounded answer.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<String>,
}

/// One element of a streamed answer.
///
/// A stream yields any number of `Delta`s followed by exactly one terminal
/// event (`Done`, `Failed`, or `Cancelled`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Delta { text: String },
    Done { citations: Vec<String> },
    Failed { error: String, citations: Vec<String> },
    Cancelled { citations: Vec<String> },
}

impl AnswerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnswerEvent::Delta { .. })
    }
}

/// Restricts a vector search. Passed to the index unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<String>>,
}

impl SearchFilter {
    pub fn documents(ids: Vec<String>) -> Self {
        Self {
            document_ids: Some(ids),
        }
    }

    pub fn matches(&self, document_id: &str) -> bool {
        match &self.document_ids {
            Some(ids) => ids.iter().any(|id| id == document_id),
            None => true,
        }
    }
}

/// A retrieved chunk with its neighbouring chunk texts.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub node: Node,
    pub score: f32,
    pub previous_texts: Vec<String>,
    pub next_texts: Vec<String>,
}

/// Current time in microseconds since the epoch.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
