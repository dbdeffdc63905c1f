//! Structure-aware chunking for scripture-like texts
//!
//! Detection order: chapter/book/psalm headings, then `chapter:verse`
//! lines grouped per chapter, then numbered sayings `(n)`. A marker kind is
//! used only when it occurs at least `min_markers` times. Sections longer
//! than `max_chars` are subdivided by the fixed-size chunker and keep their
//! label.

use super::{make_label, trim_span, Chunk, Chunker, FixedSizeChunker};
use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use regex::Regex;

const HEADING_PATTERN: &str = r"(?im)^[ \t]*((?:chapter|book|psalm)[ \t]+(?:\d+|[ivxlcdm]+))\b";
const VERSE_PATTERN: &str = r"(?m)^[ \t]*(\d+):\d+\b";
const SAYING_PATTERN: &str = r"\((\d+)\)";

/// Marker position and the label of the section it opens
type Marker = (usize, String);

/// Chunker following structural markers, with a fixed-size fallback
pub struct StructuralChunker {
    heading: Regex,
    verse: Regex,
    saying: Regex,
    min_markers: usize,
    max_chars: usize,
    fallback: FixedSizeChunker,
}

impl StructuralChunker {
    /// Create a chunker
    pub fn new(max_chars: usize, overlap_chars: usize, min_markers: usize) -> Result<Self> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| Error::Config(format!("invalid chunking pattern: {}", e)))
        };
        Ok(Self {
            heading: compile(HEADING_PATTERN)?,
            verse: compile(VERSE_PATTERN)?,
            saying: compile(SAYING_PATTERN)?,
            min_markers: min_markers.max(1),
            max_chars: max_chars.max(1),
            fallback: FixedSizeChunker::new(max_chars, overlap_chars),
        })
    }

    /// Create a chunker from configuration
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(
            config.max_chars,
            config.overlap_chars,
            config.min_structural_markers,
        )
    }

    fn headings(&self, text: &str) -> Vec<Marker> {
        self.heading
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| (m.start(), make_label(m.as_str())))
            .collect()
    }

    fn verses(&self, text: &str) -> Vec<Marker> {
        let mut markers: Vec<Marker> = Vec::new();
        let mut count = 0;
        let mut current: Option<&str> = None;
        for caps in self.verse.captures_iter(text) {
            let (Some(whole), Some(chapter)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            count += 1;
            if current != Some(chapter.as_str()) {
                current = Some(chapter.as_str());
                let start = whole.start() + (whole.as_str().len() - whole.as_str().trim_start().len());
                markers.push((start, format!("chapter{}", chapter.as_str())));
            }
        }
        if count < self.min_markers {
            markers.clear();
        }
        markers
    }

    fn sayings(&self, text: &str) -> Vec<Marker> {
        self.saying
            .captures_iter(text)
            .filter_map(|c| Some((c.get(0)?.start(), format!("saying{}", c.get(1)?.as_str()))))
            .collect()
    }

    fn detect(&self, text: &str) -> Vec<Marker> {
        let headings = self.headings(text);
        if headings.len() >= self.min_markers {
            return headings;
        }
        let verses = self.verses(text);
        if !verses.is_empty() {
            return verses;
        }
        let sayings = self.sayings(text);
        if sayings.len() >= self.min_markers {
            return sayings;
        }
        Vec::new()
    }

    fn push_section(&self, text: &str, start: usize, end: usize, label: Option<&str>, out: &mut Vec<Chunk>) {
        let Some(span) = trim_span(text, start, end) else {
            return;
        };
        if text[span.start..span.end].chars().count() > self.max_chars {
            self.fallback.chunk_range(text, span.start, span.end, label, out);
        } else {
            out.push(Chunk {
                span,
                label: label.map(str::to_string),
            });
        }
    }
}

impl Chunker for StructuralChunker {
    fn chunk(&self, text: &str) -> Vec<Chunk> {
        let markers = self.detect(text);
        if markers.is_empty() {
            return self.fallback.chunk(text);
        }

        let mut out = Vec::new();
        // Text before the first marker, e.g. a title
        self.push_section(text, 0, markers[0].0, None, &mut out);
        for (i, (start, label)) in markers.iter().enumerate() {
            let end = markers.get(i + 1).map(|m| m.0).unwrap_or(text.len());
            self.push_section(text, *start, end, Some(label), &mut out);
        }
        out
    }
}
