//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file (default: `config/prag.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//! See `config/prag.example.toml` for the full layout.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use private_rag_core::chat::{ChatSettings, DEFAULT_SYSTEM_PROMPT};
use private_rag_core::ingest::IngestSettings;
use private_rag_core::splitter::SplitterConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub splitter: SplitterSection,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. Writes are serialized by the ingestion pipeline, so extra
    /// connections only serve concurrent readers.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
        }
    }
}

fn default_storage_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SplitterSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for SplitterSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are skipped during folder ingestion.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    4
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
    ]
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `mock` or `local`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
        }
    }
}

fn default_embedding_provider() -> String {
    "mock".to_string()
}
fn default_dims() -> usize {
    384
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Pause between streamed words of the mock model.
    #[serde(default)]
    pub mock_delay_ms: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            system_prompt: default_system_prompt(),
            max_context_tokens: default_max_context_tokens(),
            mock_delay_ms: None,
        }
    }
}

fn default_llm_provider() -> String {
    "mock".to_string()
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_max_context_tokens() -> usize {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub prev_next_chunks: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: None,
            prev_next_chunks: 0,
        }
    }
}

fn default_top_k() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    /// Deadline for each embedding, store, or LLM call. `0` disables it.
    #[serde(default = "default_backend_secs")]
    pub backend_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            backend_secs: default_backend_secs(),
        }
    }
}

fn default_backend_secs() -> u64 {
    60
}

impl TimeoutsConfig {
    pub fn backend(&self) -> Option<Duration> {
        (self.backend_secs > 0).then(|| Duration::from_secs(self.backend_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8001".to_string()
}

impl Config {
    pub fn splitter_config(&self) -> SplitterConfig {
        SplitterConfig {
            chunk_size: self.splitter.chunk_size,
            chunk_overlap: self.splitter.chunk_overlap,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            batch_size: self.ingestion.batch_size,
            concurrency: self.ingestion.concurrency,
            timeout: self.timeouts.backend(),
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            top_k: self.retrieval.top_k,
            similarity_threshold: self.retrieval.similarity_threshold,
            max_context_tokens: self.llm.max_context_tokens,
            system_prompt: self.llm.system_prompt.clone(),
            timeout: self.timeouts.backend(),
        }
    }

    pub fn uses_sqlite(&self) -> bool {
        self.storage.backend == "sqlite"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        bail!("db.max_connections must be > 0");
    }

    // Splitter
    if config.splitter.chunk_size == 0 {
        bail!("splitter.chunk_size must be > 0");
    }
    if config.splitter.chunk_overlap >= config.splitter.chunk_size {
        bail!(
            "splitter.chunk_overlap ({}) must be smaller than splitter.chunk_size ({})",
            config.splitter.chunk_overlap,
            config.splitter.chunk_size
        );
    }

    // Ingestion
    if config.ingestion.batch_size == 0 {
        bail!("ingestion.batch_size must be > 0");
    }
    if config.ingestion.concurrency == 0 {
        bail!("ingestion.concurrency must be > 0");
    }

    // Retrieval / generation
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if let Some(t) = config.retrieval.similarity_threshold {
        if !(-1.0..=1.0).contains(&t) {
            bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }
    }
    if config.llm.max_context_tokens == 0 {
        bail!("llm.max_context_tokens must be > 0");
    }
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }

    match config.storage.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown storage backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }
    match config.embedding.provider.as_str() {
        "mock" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be mock or local.",
            other
        ),
    }
    match config.llm.provider.as_str() {
        "mock" => {}
        other => bail!("Unknown llm provider: '{}'. Must be mock.", other),
    }

    Ok(())
}
