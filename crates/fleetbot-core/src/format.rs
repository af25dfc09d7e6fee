//! Reply envelope and message chunking.

use fleetbot_slack::{Block, Content};

/// Slack refuses messages with more blocks than this.
pub const MAX_BLOCKS_PER_MESSAGE: usize = 50;

/// What a handler hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Chunks(Vec<String>),
    Blocks(Vec<Block>),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Ordered messages to deliver: the first replaces the placeholder, the
    /// rest go to the thread. Text is re-chunked to `max_chars` so no message
    /// exceeds the transport limit.
    pub fn into_messages(self, max_chars: usize) -> Vec<Content> {
        let messages: Vec<Content> = match self {
            Self::Text(text) => chunk_text(&text, max_chars)
                .into_iter()
                .map(Content::Text)
                .collect(),
            Self::Chunks(chunks) => chunks
                .iter()
                .flat_map(|chunk| chunk_text(chunk, max_chars))
                .map(Content::Text)
                .collect(),
            Self::Blocks(blocks) => blocks
                .chunks(MAX_BLOCKS_PER_MESSAGE)
                .map(|group| Content::Blocks(group.to_vec()))
                .collect(),
        };
        let messages: Vec<Content> = messages
            .into_iter()
            .filter(|m| !matches!(m, Content::Text(t) if t.is_empty()))
            .collect();
        let blank = messages
            .iter()
            .all(|m| matches!(m, Content::Text(t) if t.trim().is_empty()));
        if blank {
            vec![Content::Text("No output.".to_string())]
        } else {
            messages
        }
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Splits land on the last newline at or before the limit and that newline is
/// dropped, so `chunks.join("\n")` gives back the input. A single line longer
/// than the limit is cut at the limit with nothing dropped.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    if rest.is_empty() {
        return chunks;
    }

    loop {
        if rest.chars().count() <= max_chars {
            chunks.push(rest.to_string());
            break;
        }
        let limit = byte_offset(rest, max_chars);
        let split = if rest.as_bytes().get(limit) == Some(&b'\n') {
            Some(limit)
        } else {
            rest[..limit].rfind('\n')
        };
        match split {
            Some(at) => {
                chunks.push(rest[..at].to_string());
                rest = &rest[at + 1..];
            }
            None => {
                chunks.push(rest[..limit].to_string());
                rest = &rest[limit..];
            }
        }
        if rest.is_empty() {
            break;
        }
    }
    chunks
}

/// Chunk `body` and wrap every piece in its own code fence.
pub fn code_block_chunks(body: &str, max_chars: usize) -> Vec<String> {
    const FENCE_OVERHEAD: usize = 6;
    let body = if body.is_empty() { " " } else { body };
    chunk_text(body, max_chars.saturating_sub(FENCE_OVERHEAD).max(1))
        .into_iter()
        .map(|chunk| format!("```{}```", chunk))
        .collect()
}

/// Join `pieces` with newlines into as few messages as fit `max_chars`.
/// Pieces are never merged across a message boundary, so a fenced code
/// chunk stays whole.
pub fn pack(pieces: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut messages: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for piece in pieces
        .into_iter()
        .flat_map(|p| if p.is_empty() { vec![p] } else { chunk_text(&p, max_chars) })
    {
        let len = piece.chars().count();
        if !current.is_empty() && current_len + 1 + len > max_chars {
            messages.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(&piece);
        current_len += len;
    }
    if !current.is_empty() {
        messages.push(current);
    }
    messages
}
