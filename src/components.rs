//! Startup wiring.
//!
//! Every backend is built exactly once from [`Config`] and handed to the
//! two pipelines through their constructors. Nothing below this module
//! knows which concrete provider it is talking to.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use private_rag_core::chat::ChatEngine;
use private_rag_core::ingest::IngestionPipeline;
use private_rag_core::splitter::TextSplitter;
use private_rag_core::store::memory::{InMemoryNodeStore, InMemoryVectorIndex};
use private_rag_core::store::{NodeStore, VectorIndex};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedding_service;
use crate::llm::create_llm_service;
use crate::migrate;
use crate::sqlite_store::{SqliteNodeStore, SqliteVectorIndex};

/// The assembled application graph.
#[derive(Clone)]
pub struct Components {
    pub ingestion: Arc<IngestionPipeline>,
    pub chat: Arc<ChatEngine>,
    /// Present for the `sqlite` storage backend.
    pub pool: Option<SqlitePool>,
}

impl Components {
    /// Build every backend from configuration.
    ///
    /// For SQLite storage the schema is applied and the ingestion ledger is
    /// restored from the documents already on disk.
    pub async fn build(config: &Config) -> Result<Self> {
        let embedder = create_embedding_service(&config.embedding)?;
        let llm = create_llm_service(&config.llm)?;
        let splitter = TextSplitter::new(config.splitter_config())
            .context("Invalid splitter configuration")?;

        let (nodes, vectors, pool): (Arc<dyn NodeStore>, Arc<dyn VectorIndex>, Option<SqlitePool>) =
            if config.uses_sqlite() {
                let pool = db::connect(config).await?;
                migrate::apply(&pool).await?;
                (
                    Arc::new(SqliteNodeStore::new(pool.clone())),
                    Arc::new(SqliteVectorIndex::new(pool.clone())),
                    Some(pool),
                )
            } else {
                (
                    Arc::new(InMemoryNodeStore::new()),
                    Arc::new(InMemoryVectorIndex::new()),
                    None,
                )
            };

        let ingestion = Arc::new(IngestionPipeline::new(
            splitter,
            embedder.clone(),
            nodes.clone(),
            vectors.clone(),
            config.ingest_settings(),
        ));
        let restored = ingestion
            .restore()
            .await
            .context("Failed to restore ingestion ledger")?;

        let chat = Arc::new(ChatEngine::new(
            embedder.clone(),
            nodes,
            vectors,
            llm.clone(),
            config.chat_settings(),
        ));

        info!(
            storage = %config.storage.backend,
            embedding = embedder.model_name(),
            llm = llm.model_name(),
            restored,
            "components ready"
        );

        Ok(Self {
            ingestion,
            chat,
            pool,
        })
    }

    /// Close the database pool, if any.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}
