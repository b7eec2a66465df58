//! OpenAI-compatible HTTP server.
//!
//! Exposes the ingestion pipeline and chat engine as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/v1/ingest/text` | Ingest raw text under a new document id |
//! | `GET`  | `/v1/ingest/list` | List ingested documents and their status |
//! | `DELETE` | `/v1/ingest/{doc_id}` | Delete a document and its nodes |
//! | `POST` | `/v1/ingest/wipe` | Delete everything |
//! | `POST` | `/v1/chunks` | Relevant chunks for a query, with neighbours |
//! | `POST` | `/v1/chat/completions` | Chat with optional retrieval; SSE when `stream` |
//! | `POST` | `/v1/completions` | Single-prompt variant of chat completions |
//! | `POST` | `/v1/embeddings` | Embed one or more texts |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "top_k must be a positive integer" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `backend_unavailable` | 503 |
//! | `consistency` | 500 |
//! | `cancelled` | 499 |
//!
//! # Streaming
//!
//! With `"stream": true` the response is `text/event-stream`: one `data:`
//! event per answer event (`delta`, then exactly one of `done`, `failed`,
//! `cancelled`), followed by `data: [DONE]`. A client that disconnects
//! cancels generation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use private_rag_core::cancel::CancellationToken;
use private_rag_core::chat::{AnswerStream, ChatRequest};
use private_rag_core::models::{
    ChatMessage, ContextChunk, IngestedDocumentRecord, SearchFilter,
};
use private_rag_core::RagError;

use crate::components::Components;
use crate::config::Config;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    components: Components,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(components: Components, config: Config) -> Self {
        Self {
            components,
            config: Arc::new(config),
        }
    }
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let components = Components::build(config).await?;
    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(components, config.clone()));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("private-rag server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// All routes, with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/ingest/text", post(handle_ingest_text))
        .route("/v1/ingest/list", get(handle_list))
        .route("/v1/ingest/wipe", post(handle_wipe))
        .route("/v1/ingest/{doc_id}", delete(handle_delete))
        .route("/v1/chunks", post(handle_chunks))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/completions", post(handle_completions))
        .route("/v1/embeddings", post(handle_embeddings))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Consistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Non-standard "client closed request".
            RagError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Ingestion ============

#[derive(Deserialize)]
struct IngestTextRequest {
    file_name: String,
    text: String,
}

#[derive(Serialize)]
struct IngestResponse {
    object: &'static str,
    data: Vec<IngestedDocumentRecord>,
}

async fn handle_ingest_text(
    State(state): State<AppState>,
    Json(req): Json<IngestTextRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    if req.file_name.trim().is_empty() {
        return Err(RagError::validation("file_name must not be empty").into());
    }
    let record = state
        .components
        .ingestion
        .ingest_text(&req.file_name, &req.text)
        .await?;
    Ok(Json(IngestResponse {
        object: "list",
        data: vec![record],
    }))
}

async fn handle_list(State(state): State<AppState>) -> Json<IngestResponse> {
    Json(IngestResponse {
        object: "list",
        data: state.components.ingestion.list(),
    })
}

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    deleted_nodes: usize,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted_nodes = state.components.ingestion.delete(&doc_id).await?;
    Ok(Json(DeleteResponse {
        document_id: doc_id,
        deleted_nodes,
    }))
}

#[derive(Serialize)]
struct WipeResponse {
    deleted_documents: usize,
}

async fn handle_wipe(State(state): State<AppState>) -> Result<Json<WipeResponse>, AppError> {
    let deleted_documents = state.components.ingestion.wipe().await?;
    Ok(Json(WipeResponse { deleted_documents }))
}

// ============ POST /v1/chunks ============

/// Restricts retrieval to the listed documents.
#[derive(Deserialize)]
struct ContextFilter {
    #[serde(default)]
    docs_ids: Option<Vec<String>>,
}

fn search_filter(filter: Option<ContextFilter>) -> SearchFilter {
    SearchFilter {
        document_ids: filter.and_then(|f| f.docs_ids),
    }
}

#[derive(Deserialize)]
struct ChunksRequest {
    text: String,
    #[serde(default)]
    context_filter: Option<ContextFilter>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    prev_next_chunks: Option<usize>,
}

#[derive(Serialize)]
struct ChunksResponse {
    object: &'static str,
    data: Vec<ContextChunk>,
}

async fn handle_chunks(
    State(state): State<AppState>,
    Json(req): Json<ChunksRequest>,
) -> Result<Json<ChunksResponse>, AppError> {
    let limit = req.limit.unwrap_or(10);
    let prev_next = req
        .prev_next_chunks
        .unwrap_or(state.config.retrieval.prev_next_chunks);
    let data = state
        .components
        .chat
        .chunks(&req.text, limit, &search_filter(req.context_filter), prev_next)
        .await?;
    Ok(Json(ChunksResponse {
        object: "list",
        data,
    }))
}

// ============ Chat / completions ============

fn default_include_sources() -> bool {
    true
}

#[derive(Deserialize)]
struct ChatBody {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    use_context: bool,
    #[serde(default)]
    context_filter: Option<ContextFilter>,
    #[serde(default = "default_include_sources")]
    include_sources: bool,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionBody {
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    use_context: bool,
    #[serde(default)]
    context_filter: Option<ContextFilter>,
    #[serde(default = "default_include_sources")]
    include_sources: bool,
    #[serde(default)]
    stream: bool,
}

impl From<CompletionBody> for ChatBody {
    fn from(body: CompletionBody) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = body.system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(body.prompt));
        ChatBody {
            messages,
            use_context: body.use_context,
            context_filter: body.context_filter,
            include_sources: body.include_sources,
            stream: body.stream,
        }
    }
}

#[derive(Serialize)]
struct Completion {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<CompletionChoice>,
}

#[derive(Serialize)]
struct CompletionChoice {
    index: usize,
    finish_reason: &'static str,
    message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<Vec<String>>,
}

async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    run_chat(state, body).await
}

async fn handle_completions(
    State(state): State<AppState>,
    Json(body): Json<CompletionBody>,
) -> Result<Response, AppError> {
    run_chat(state, body.into()).await
}

async fn run_chat(state: AppState, body: ChatBody) -> Result<Response, AppError> {
    let mut request = ChatRequest::new(body.messages).with_filter(search_filter(body.context_filter));
    request.use_context = body.use_context;
    let engine = &state.components.chat;

    if body.stream {
        let events = engine
            .chat_stream(request, CancellationToken::never())
            .await?;
        return Ok(sse_response(events).into_response());
    }

    let answer = engine.chat(request, &CancellationToken::never()).await?;
    let completion = Completion {
        id: uuid::Uuid::new_v4().to_string(),
        object: "completion",
        created: chrono::Utc::now().timestamp(),
        model: engine.llm_model().to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            finish_reason: "stop",
            message: ChatMessage::assistant(answer.text),
            sources: body.include_sources.then_some(answer.citations),
        }],
    };
    Ok(Json(completion).into_response())
}

/// Answer events as SSE `data:` lines, closed by `[DONE]`.
///
/// Axum drops the stream when the client goes away, which cancels the
/// generation through the stream's drop guard.
fn sse_response(
    events: AnswerStream,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let data = events.map(|event| {
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|e| format!("{{\"type\":\"failed\",\"error\":\"{}\"}}", e));
        Ok(Event::default().data(payload))
    });
    let done = stream::once(async { Ok(Event::default().data("[DONE]")) });
    Sse::new(data.chain(done)).keep_alive(KeepAlive::default())
}

// ============ POST /v1/embeddings ============

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct EmbeddingsRequest {
    input: EmbeddingInput,
}

#[derive(Serialize)]
struct EmbeddingsResponse {
    object: &'static str,
    model: String,
    data: Vec<EmbeddingData>,
}

#[derive(Serialize)]
struct EmbeddingData {
    object: &'static str,
    index: usize,
    embedding: Vec<f32>,
}

async fn handle_embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>, AppError> {
    let texts = match req.input {
        EmbeddingInput::One(s) => vec![s],
        EmbeddingInput::Many(v) => v,
    };
    let vectors = state.components.chat.embed(&texts).await?;
    Ok(Json(EmbeddingsResponse {
        object: "list",
        model: state.components.chat.embedding_model().to_string(),
        data: vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| EmbeddingData {
                object: "embedding",
                index,
                embedding,
            })
            .collect(),
    }))
}
