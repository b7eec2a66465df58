//! LLM service trait and the offline mock backend.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::models::{ChatMessage, Role};

/// Incremental text deltas from a streaming completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The messages sent to the model for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// Content of the last user message, if any.
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub fn system(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// Produces completions, whole or streamed.
///
/// Both methods receive a [`CancellationToken`]. Implementations must stop
/// producing output (and release any backend resources) once the token is
/// cancelled or the returned stream is dropped.
#[async_trait]
pub trait LlmService: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String>;

    async fn stream_complete(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream>;
}

/// Deterministic offline model.
///
/// Answers with the question and the first line of the supplied context,
/// streamed word by word. `delay` spaces out deltas so cancellation and
/// timeouts can be observed.
#[derive(Debug, Clone, Default)]
pub struct MockLlm {
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    fn respond(prompt: &Prompt) -> String {
        let question = prompt.last_user().unwrap_or_default().trim();
        let context_line = prompt.system().and_then(|s| {
            s.split_once(CONTEXT_MARKER)
                .and_then(|(_, ctx)| ctx.lines().map(str::trim).find(|l| !l.is_empty()))
        });
        match context_line {
            Some(line) => format!("You asked: {}. From the context: {}", question, line),
            None => format!("You asked: {}.", question),
        }
    }
}

/// Header that introduces retrieved context in the system message.
pub const CONTEXT_MARKER: &str = "Context information is below.";

#[async_trait]
impl LlmService for MockLlm {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String> {
        cancel.check()?;
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        cancel.check()?;
        Ok(Self::respond(prompt))
    }

    async fn stream_complete(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        cancel.check()?;
        let text = Self::respond(prompt);
        let words: Vec<String> = text
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.delay;
        let cancel = cancel.clone();

        let s = stream::unfold(words.into_iter(), move |mut words| {
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let word = words.next()?;
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Some((Ok(word), words))
            }
        });
        Ok(Box::pin(s))
    }
}
