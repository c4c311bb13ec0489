use crate::config::IngestConfig;

/// A token-bounded slice of a document
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub index: usize,
    pub text: String,
    pub tokens: usize,
}

/// Split document text into overlapping chunks with ids derived from `doc_id`
pub fn chunk_document(doc_id: &str, text: &str, config: &IngestConfig) -> Vec<Chunk> {
    split_with_overlap(text, config.chunk_size_tokens, config.chunk_overlap_tokens)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            id: format!("{}-chunk-{}", doc_id, index),
            index,
            tokens: estimate_tokens(&text),
            text,
        })
        .collect()
}

/// Split text into windows of ~`size_tokens`, each starting `overlap_tokens` before the previous end.
///
/// Works on chars (~4 per token) so multi-byte text never splits mid-character.
/// Window ends snap back to whitespace or sentence punctuation found in the
/// last fifth of the window.
pub fn split_with_overlap(text: &str, size_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let window = (size_tokens * 4).max(1);
    let overlap = overlap_tokens * 4;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let hard_end = (start + window).min(chars.len());
        let end = if hard_end < chars.len() {
            let floor = hard_end.saturating_sub(window / 5).max(start + 1);
            (floor..hard_end)
                .rev()
                .find(|&i| is_break(chars[i]))
                .map(|i| i + 1)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= chars.len() {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

fn is_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '.' | '!' | '?')
}

/// Estimate token count from text (1 token ≈ 4 bytes, rounded up)
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Longest prefix of `text` whose estimate fits in `budget` tokens
pub fn truncate_to_tokens(text: &str, budget: usize) -> &str {
    let max_bytes = budget * 4;
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
