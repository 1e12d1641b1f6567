//! Byte-size-aware message chunking.
//!
//! A message that fits under the ceiling together with the system prompt is
//! sent as a single chunk. Anything larger is split at word boundaries and
//! packed greedily so that each chunk plus the prompt stays within the ceiling.
//! Chunks are verbatim slices of the message, so whitespace inside a chunk
//! (line breaks, indentation) reaches the upstream unchanged. At a split, one
//! separator character is consumed and any further whitespace opens the next
//! chunk, so joining the chunks with single spaces restores every gap that
//! starts with a space.

use super::size::size_of;

/// Separator placed between the system prompt and the message when checking
/// whether the whole message fits in one request.
const PROMPT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Position in emission order, starting at zero.
    pub index: usize,
}

/// Split `message` into word-aligned chunks that each fit under `ceiling`
/// bytes alongside `system_prompt`.
///
/// A single word that alone exceeds the ceiling is emitted as its own chunk;
/// words are never split. A blank message yields no chunks.
pub fn chunk(message: &str, system_prompt: &str, ceiling: usize) -> Vec<Chunk> {
    if message.trim().is_empty() {
        return Vec::new();
    }

    let whole = size_of(system_prompt) + size_of(PROMPT_SEPARATOR) + size_of(message);
    if whole <= ceiling {
        return vec![Chunk {
            text: message.to_string(),
            index: 0,
        }];
    }

    let prompt_size = size_of(system_prompt);
    let mut slices: Vec<&str> = Vec::new();
    // Byte range of the chunk being packed.
    let mut current: Option<(usize, usize)> = None;

    for (start, end) in word_spans(message) {
        current = match current {
            None => Some((start, end)),
            Some((chunk_start, _)) if size_of(&message[chunk_start..end]) + prompt_size <= ceiling => {
                Some((chunk_start, end))
            }
            Some((chunk_start, chunk_end)) => {
                slices.push(&message[chunk_start..chunk_end]);
                Some((continuation_start(message, chunk_end), end))
            }
        };
    }

    if let Some((chunk_start, chunk_end)) = current {
        slices.push(&message[chunk_start..chunk_end]);
    }

    slices
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            text: text.to_string(),
            index,
        })
        .collect()
}

/// Start of the chunk that follows a split at `boundary`, which always sits
/// on a whitespace character.
fn continuation_start(message: &str, boundary: usize) -> usize {
    message[boundary..]
        .chars()
        .next()
        .map_or(boundary, |c| boundary + c.len_utf8())
}

/// Byte ranges of the whitespace-separated words in `text`.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }

    if let Some(s) = start {
        spans.push((s, text.len()));
    }

    spans
}
