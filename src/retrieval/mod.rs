//! Retrieval exposed to the generation layer
//!
//! [`HybridRetriever`] fuses semantic and keyword rankings and returns
//! [`Passage`]s carrying their record id and span for provenance.

mod fusion;
mod hybrid;

pub use fusion::reciprocal_rank_fusion;
pub use hybrid::HybridRetriever;

use crate::index::{Span, VectorEntry};
use crate::store::RecordId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A retrieved passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Passage text in the view the reader may see
    pub text: String,
    /// Record the passage came from
    pub record_id: RecordId,
    /// Offsets into the record view
    pub span: Span,
    /// Structural label
    pub label: Option<String>,
    /// Record source
    pub source: String,
    /// Record event time
    pub event_time: DateTime<Utc>,
    /// Fused score
    pub score: f32,
}

/// Restrictions applied to candidates before ranking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalFilter {
    /// Only these sources, when non-empty
    #[serde(default)]
    pub sources: Vec<String>,
    /// Only records attached to this bundle
    #[serde(default)]
    pub bundle: Option<String>,
    /// Events at or after this time
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Events at or before this time
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl RetrievalFilter {
    /// Restrict to a bundle
    pub fn bundle(mut self, name: impl Into<String>) -> Self {
        self.bundle = Some(name.into());
        self
    }

    /// Restrict to a source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Whether an index entry passes the source and time restrictions.
    /// Bundle membership is resolved by the caller.
    pub fn matches(&self, entry: &VectorEntry) -> bool {
        (self.sources.is_empty() || self.sources.iter().any(|s| s == &entry.source))
            && self.since.map_or(true, |t| entry.event_time >= t)
            && self.until.map_or(true, |t| entry.event_time <= t)
    }
}
