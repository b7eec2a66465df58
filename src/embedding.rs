//! Embedding backend selection.
//!
//! # Supported Providers
//!
//! | Config Value | Service |
//! |-------------|---------|
//! | `"mock"` | [`MockEmbedding`]: deterministic feature hashing, no model needed |
//! | `"local"` | `LocalEmbedding`: fastembed, requires `--features local-embeddings` |
//!
//! Local models are downloaded from Hugging Face on first use and cached.
//! After that, embeddings run entirely offline.

use anyhow::{bail, Result};
use std::sync::Arc;

use private_rag_core::embedding::{EmbeddingService, MockEmbedding};

use crate::config::EmbeddingConfig;

/// Build the configured [`EmbeddingService`].
pub fn create_embedding_service(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockEmbedding::new(config.dims))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(local::LocalEmbedding::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(feature = "local-embeddings")]
mod local {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    use private_rag_core::embedding::EmbeddingService;
    use private_rag_core::error::{Backend, RagError};

    use crate::config::EmbeddingConfig;

    const DEFAULT_MODEL: &str = "all-minilm-l6-v2";

    /// fastembed-backed service. The model is loaded lazily on the first
    /// call and reused afterwards.
    pub struct LocalEmbedding {
        model_name: String,
        model: fastembed::EmbeddingModel,
        dims: usize,
        batch_size: usize,
        loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedding {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let (model, native_dims) = resolve_model(&model_name)?;
            if config.dims != native_dims {
                bail!(
                    "embedding.dims is {} but model '{}' produces {} dimensions",
                    config.dims,
                    model_name,
                    native_dims
                );
            }
            Ok(Self {
                model_name,
                model,
                dims: native_dims,
                batch_size: 32,
                loaded: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
        use fastembed::EmbeddingModel::*;
        Ok(match name {
            "all-minilm-l6-v2" => (AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (BGESmallENV15, 384),
            "bge-base-en-v1.5" => (BGEBaseENV15, 768),
            "bge-large-en-v1.5" => (BGELargeENV15, 1024),
            "nomic-embed-text-v1.5" => (NomicEmbedTextV15, 768),
            "multilingual-e5-small" => (MultilingualE5Small, 384),
            "multilingual-e5-base" => (MultilingualE5Base, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base",
                other
            ),
        })
    }

    #[async_trait]
    impl EmbeddingService for LocalEmbedding {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> private_rag_core::Result<Vec<Vec<f32>>> {
            let texts = texts.to_vec();
            let loaded = self.loaded.clone();
            let model = self.model.clone();
            let batch_size = self.batch_size;

            tokio::task::spawn_blocking(move || {
                let mut guard = loaded
                    .lock()
                    .map_err(|_| RagError::backend(Backend::Embedding, "model lock poisoned"))?;
                if guard.is_none() {
                    let init = fastembed::InitOptions::new(model).with_show_download_progress(false);
                    let text_model = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                        RagError::backend(Backend::Embedding, format!("failed to load model: {}", e))
                    })?;
                    *guard = Some(text_model);
                }
                match guard.as_mut() {
                    Some(m) => m
                        .embed(texts, Some(batch_size))
                        .map_err(|e| RagError::backend(Backend::Embedding, e)),
                    None => Err(RagError::backend(Backend::Embedding, "model not loaded")),
                }
            })
            .await
            .map_err(|e| RagError::backend(Backend::Embedding, e))?
        }
    }
}
