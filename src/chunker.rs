//! Text chunking for document ingestion.
//!
//! Splits extracted plain text into overlapping chunks, trimming at sentence
//! boundaries where possible. Chunks are indexed in document order; the index
//! is the chunk's identity within its document.

use crate::tokens::TokenEstimator;

/// One chunk of a document, carrying its position and token estimate.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
    pub token_estimate: usize,
}

/// Split text into overlapping chunks of at most `chunk_size` characters.
pub fn split_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    max_chunks: usize,
    estimator: &dyn TokenEstimator,
) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();

    if total == 0 || chunk_size == 0 {
        return chunks;
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut start = 0;
    let mut chunk_index = 0;

    while start < total && chunks.len() < max_chunks {
        let end = (start + chunk_size).min(total);
        let window: String = chars[start..end].iter().collect();

        let body = if end < total {
            cut_at_sentence_boundary(&window)
        } else {
            window
        };
        let trimmed = body.trim();

        if !trimmed.is_empty() {
            chunks.push(TextChunk {
                text: trimmed.to_string(),
                chunk_index,
                token_estimate: estimator.estimate(trimmed),
            });
            chunk_index += 1;
        }

        start += step;
    }

    chunks
}

/// Cut the window at the last sentence ending in its final fifth, if any.
fn cut_at_sentence_boundary(window: &str) -> String {
    const ENDINGS: [&str; 6] = [". ", "! ", "? ", ".\n", "!\n", "?\n"];

    let search_start = window
        .char_indices()
        .map(|(i, _)| i)
        .nth(window.chars().count() * 4 / 5)
        .unwrap_or(0);
    let tail = &window[search_start..];

    for ending in ENDINGS {
        if let Some(pos) = tail.rfind(ending) {
            let cut = search_start + pos + ending.len();
            return window[..cut].to_string();
        }
    }

    window.to_string()
}
