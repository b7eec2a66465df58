//! Overlapping fixed-size text splitter.
//!
//! Splits document text into [`Span`]s of at most `chunk_size` characters,
//! each starting `chunk_overlap` characters before the previous one ended.
//! Spans keep their byte offsets into the original text so retrieved
//! chunks can be cited back to their source.
//!
//! # Algorithm
//!
//! 1. If the remaining text fits in `chunk_size`, emit it and stop.
//! 2. Otherwise look for a break inside the back half of the window:
//!    the last newline, then the last whitespace, then a hard cut.
//! 3. Emit the span and restart `chunk_overlap` characters before its end.
//!
//! Offsets always land on UTF-8 char boundaries and every step advances,
//! so the output is finite and deterministic.
//!
//! # Example
//!
//! ```rust
//! use private_rag_core::splitter::{SplitterConfig, TextSplitter};
//!
//! let splitter = TextSplitter::new(SplitterConfig { chunk_size: 100, chunk_overlap: 20 }).unwrap();
//! let spans = splitter.split("Hello world.\n\nSecond paragraph.");
//! assert_eq!(spans.len(), 1);
//! assert_eq!(spans[0].start, 0);
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// Approximate characters-per-token ratio used for context budgeting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Splitter sizes, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 128,
        }
    }
}

/// A contiguous byte range of the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TextSplitter {
    config: SplitterConfig,
}

impl TextSplitter {
    pub fn new(config: SplitterConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(RagError::validation("chunk_size must be > 0"));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(RagError::validation(
                "chunk_overlap must be smaller than chunk_size",
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> SplitterConfig {
        self.config
    }

    /// Split `text` into ordered, possibly overlapping spans.
    ///
    /// Returns an empty vector for empty text and exactly one span when
    /// the text fits in a single chunk.
    pub fn split(&self, text: &str) -> Vec<Span> {
        if text.is_empty() {
            return Vec::new();
        }

        // Byte offset of every char start, plus the end of the text.
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total = bounds.len() - 1;
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut spans = Vec::new();
        let mut start = 0usize;

        loop {
            if total - start <= size {
                spans.push(make_span(text, bounds[start], bounds[total]));
                break;
            }

            let hard_end = start + size;
            let min_end = start + (overlap + 1).max(size / 2);
            let end = find_break(text, &bounds, min_end, hard_end).unwrap_or(hard_end);

            spans.push(make_span(text, bounds[start], bounds[end]));
            start = end - overlap;
        }

        spans
    }
}

/// Latest char index in `min_end..=hard_end` that directly follows a
/// newline, falling back to one that follows any whitespace.
fn find_break(text: &str, bounds: &[usize], min_end: usize, hard_end: usize) -> Option<usize> {
    let window = &text[bounds[min_end - 1]..bounds[hard_end]];
    let base = min_end - 1;

    let after = |pred: fn(char) -> bool| {
        window
            .chars()
            .enumerate()
            .filter(|(_, c)| pred(*c))
            .map(|(i, _)| base + i + 1)
            .last()
    };

    after(|c| c == '\n').or_else(|| after(char::is_whitespace))
}

fn make_span(text: &str, start: usize, end: usize) -> Span {
    Span {
        start,
        end,
        text: text[start..end].to_string(),
    }
}

/// SHA-256 hex digest of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rough token count for budgeting (`ceil(chars / 4)`).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}
