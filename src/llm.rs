//! LLM backend selection.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use private_rag_core::llm::{LlmService, MockLlm};

use crate::config::LlmConfig;

/// Build the configured [`LlmService`].
pub fn create_llm_service(config: &LlmConfig) -> Result<Arc<dyn LlmService>> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(match config.mock_delay_ms {
            Some(ms) => MockLlm::with_delay(Duration::from_millis(ms)),
            None => MockLlm::new(),
        })),
        other => bail!("Unknown llm provider: {}", other),
    }
}
