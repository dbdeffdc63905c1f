//! Fixed-size chunking with overlap

use super::{trim_span, Chunk, Chunker};

/// Splits text into windows of at most `max_chars` characters, each
/// overlapping the previous one by about `overlap_chars`. Windows end on
/// whitespace where possible and never split a UTF-8 character.
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl FixedSizeChunker {
    /// Create a chunker
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_chars - 1),
        }
    }

    /// Chunk `text[start..end]`, attaching `label` to every piece
    pub(crate) fn chunk_range(
        &self,
        text: &str,
        start: usize,
        end: usize,
        label: Option<&str>,
        out: &mut Vec<super::Chunk>,
    ) {
        let mut pos = start;
        while pos < end {
            let mut stop = advance_chars(text, pos, end, self.max_chars);
            if stop < end {
                if let Some(ws) = text[pos..stop].rfind(char::is_whitespace) {
                    if ws > 0 {
                        stop = pos + ws;
                    }
                }
            }
            if let Some(span) = trim_span(text, pos, stop) {
                out.push(Chunk {
                    span,
                    label: label.map(str::to_string),
                });
            }
            if stop >= end {
                break;
            }

            let mut next = retreat_chars(text, stop, self.overlap_chars);
            if next <= pos {
                next = stop;
            } else if next < stop && !preceded_by_whitespace(text, next) {
                // Start the overlap on a word boundary
                if let Some(ws) = text[next..stop].find(char::is_whitespace) {
                    let after = next + ws + char_len_at(text, next + ws);
                    if after < stop {
                        next = after;
                    }
                }
            }
            pos = next;
        }
    }
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut out = Vec::new();
        self.chunk_range(text, 0, text.len(), None, &mut out);
        out
    }
}

fn advance_chars(text: &str, from: usize, limit: usize, n: usize) -> usize {
    text[from..limit]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(limit)
}

fn retreat_chars(text: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    text[..from]
        .char_indices()
        .rev()
        .take(n)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(from)
}

fn preceded_by_whitespace(text: &str, pos: usize) -> bool {
    text[..pos].chars().next_back().map_or(true, char::is_whitespace)
}

fn char_len_at(text: &str, pos: usize) -> usize {
    text[pos..].chars().next().map_or(1, char::len_utf8)
}
