//! Typed failures for the ingestion and chat pipelines.
//!
//! Every pipeline operation returns [`Result`], so callers (CLI, HTTP
//! server) can tell bad input apart from a failing backend, a broken
//! store pairing, or a caller-initiated cancellation without parsing
//! messages.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// The backend family a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Embedding,
    NodeStore,
    VectorIndex,
    Llm,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Embedding => "embedding",
            Backend::NodeStore => "node store",
            Backend::VectorIndex => "vector index",
            Backend::Llm => "llm",
        };
        f.write_str(name)
    }
}

/// Error taxonomy shared by every pipeline operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RagError {
    /// Bad input. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A backend was unreachable, errored, or timed out.
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable { backend: Backend, message: String },

    /// The node store and vector index diverged and rollback failed.
    #[error("store consistency violated: {0}")]
    Consistency(String),

    /// The caller abandoned the request.
    #[error("operation was cancelled")]
    Cancelled,
}

impl RagError {
    pub fn validation(message: impl Into<String>) -> Self {
        RagError::Validation(message.into())
    }

    /// Wrap any displayable backend error, tagging which backend failed.
    pub fn backend(backend: Backend, err: impl fmt::Display) -> Self {
        RagError::BackendUnavailable {
            backend,
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RagError::Cancelled)
    }

    /// The failing backend, if this is a backend error.
    pub fn failed_backend(&self) -> Option<Backend> {
        match self {
            RagError::BackendUnavailable { backend, .. } => Some(*backend),
            _ => None,
        }
    }

    /// Machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "bad_request",
            RagError::BackendUnavailable { .. } => "backend_unavailable",
            RagError::Consistency(_) => "consistency",
            RagError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

/// Run a backend call under an optional deadline.
///
/// An elapsed deadline becomes [`RagError::BackendUnavailable`] for the
/// given backend, so timeouts take the same path as hard failures.
pub async fn with_timeout<T, F>(backend: Backend, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(RagError::BackendUnavailable {
                backend,
                message: format!("timed out after {} ms", limit.as_millis()),
            }),
        },
        None => fut.await,
    }
}
