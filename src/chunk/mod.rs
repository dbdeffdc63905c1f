//! Splitting record text into indexable spans
//!
//! Chunking is a pluggable strategy behind the [`Chunker`] trait. The
//! default [`StructuralChunker`] follows chapter, verse and saying markers
//! when it finds enough of them and otherwise falls back to
//! [`FixedSizeChunker`].

mod fixed;
mod structural;

pub use fixed::FixedSizeChunker;
pub use structural::StructuralChunker;

use crate::index::Span;
use serde::{Deserialize, Serialize};

/// A span of text with an optional structural label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Byte offsets into the chunked text
    pub span: Span,
    /// Structural label such as `chapter2` or `saying14`
    pub label: Option<String>,
}

/// Chunking strategy
pub trait Chunker: Send + Sync {
    /// Split `text` into non-empty chunks, in document order
    fn chunk(&self, text: &str) -> Vec<Chunk>;
}

/// Shrink `[start, end)` to exclude surrounding whitespace; `None` if
/// nothing remains
pub(crate) fn trim_span(text: &str, start: usize, end: usize) -> Option<Span> {
    let slice = &text[start..end];
    let trimmed_start = slice.trim_start();
    if trimmed_start.is_empty() {
        return None;
    }
    let lead = slice.len() - trimmed_start.len();
    let trail = slice.trim_end().len();
    Some(Span::new(start + lead, start + trail))
}

/// Label form of a heading: lowercase, whitespace removed
pub(crate) fn make_label(heading: &str) -> String {
    heading
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_span() {
        let text = "  abc \n";
        assert_eq!(trim_span(text, 0, text.len()), Some(Span::new(2, 5)));
        assert_eq!(trim_span(text, 5, 7), None);
    }

    #[test]
    fn test_make_label() {
        assert_eq!(make_label("CHAPTER 2"), "chapter2");
        assert_eq!(make_label("Chapter\tIV"), "chapteriv");
    }
}
