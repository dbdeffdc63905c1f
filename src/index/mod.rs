//! Vector and keyword indexing
//!
//! Spans of consent-permitted text are embedded by an [`Embedder`] and stored
//! in the sharded [`VectorIndex`] together with keyed token tags for lexical
//! search. Records below ANONYMIZED never reach the index.

pub mod embed;
pub mod keyword;
pub mod vector;

pub use embed::{from_config as embedder_from_config, l2_normalize, Embedder, HashingEmbedder, OllamaEmbedder};
pub use keyword::{overlap_score, tokenize, KeywordHasher};
pub use vector::{rank_order, EntryFilter, SearchHit, Span, VectorEntry, VectorIndex};
