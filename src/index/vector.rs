//! Sharded vector index with keyword tags
//!
//! Entries are grouped by record and spread over a fixed number of
//! segments chosen from the record id. Writers lock one segment, so inserts
//! for different records proceed in parallel, and removing a record touches
//! only that record's entry list.
//!
//! Similarity is cosine, computed as the inner product of L2-normalized
//! vectors on both the insert and the query side.

use super::keyword::overlap_score;
use crate::consent::ConsentLevel;
use crate::error::{Error, Result};
use crate::store::RecordId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;

/// Scores closer than this are treated as ties
const SCORE_RESOLUTION: f32 = 1e-6;

/// Byte range into the consent-permitted view of a record's text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    /// Inclusive start offset
    pub start: usize,
    /// Exclusive end offset
    pub end: usize,
}

impl Span {
    /// Create a span
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether the span is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One embedding per indexable span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// Record the span belongs to
    pub record_id: RecordId,
    /// Owner of the record
    pub owner_id: String,
    /// Record source
    pub source: String,
    /// Offsets into the view text
    pub span: Span,
    /// Structural label, e.g. `chapter2`
    #[serde(default)]
    pub label: Option<String>,
    /// Record event time, used for tie-breaks
    pub event_time: DateTime<Utc>,
    /// Consent level of the record when indexed
    pub consent_level: ConsentLevel,
    /// Unit-length embedding
    pub embedding: Vec<f32>,
    /// Sorted keyword tags
    #[serde(default)]
    pub tokens: Vec<u64>,
}

/// A scored search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Record the span belongs to
    pub record_id: RecordId,
    /// Offsets into the view text
    pub span: Span,
    /// Structural label
    pub label: Option<String>,
    /// Record event time
    pub event_time: DateTime<Utc>,
    /// Consent level of the view the span was cut from
    pub consent_level: ConsentLevel,
    /// Similarity score
    pub score: f32,
}

impl SearchHit {
    fn from_entry(entry: &VectorEntry, score: f32) -> Self {
        Self {
            record_id: entry.record_id.clone(),
            span: entry.span,
            label: entry.label.clone(),
            event_time: entry.event_time,
            consent_level: entry.consent_level,
            score,
        }
    }
}

/// Deterministic result order: score descending (quantized so near-equal
/// scores tie), then most recent event, then record id, then span start.
pub fn rank_order(a_score: f32, a: &SearchHit, b_score: f32, b: &SearchHit) -> Ordering {
    quantize(b_score)
        .cmp(&quantize(a_score))
        .then_with(|| b.event_time.cmp(&a.event_time))
        .then_with(|| a.record_id.cmp(&b.record_id))
        .then_with(|| a.span.start.cmp(&b.span.start))
}

fn quantize(score: f32) -> i64 {
    (f64::from(score) / f64::from(SCORE_RESOLUTION)).round() as i64
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Default)]
struct Segment {
    entries: HashMap<RecordId, Vec<VectorEntry>>,
}

/// Filter applied to candidates before they are scored
pub type EntryFilter<'a> = &'a (dyn Fn(&VectorEntry) -> bool + Send + Sync);

/// Approximate nearest-neighbour index over record spans
pub struct VectorIndex {
    dimension: usize,
    segments: Vec<RwLock<Segment>>,
    marked: RwLock<HashSet<RecordId>>,
}

impl VectorIndex {
    /// Create an empty index
    pub fn new(dimension: usize, segments: usize) -> Self {
        let segments = segments.max(1);
        Self {
            dimension,
            segments: (0..segments).map(|_| RwLock::new(Segment::default())).collect(),
            marked: RwLock::new(HashSet::new()),
        }
    }

    /// Embedding dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn segment(&self, record_id: &RecordId) -> &RwLock<Segment> {
        let hash = record_id
            .as_str()
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)));
        &self.segments[(hash % self.segments.len() as u64) as usize]
    }

    fn check(&self, entry: &VectorEntry, record_id: &RecordId) -> Result<()> {
        if &entry.record_id != record_id {
            return Err(Error::Internal(format!(
                "entry for {} inserted under {}",
                entry.record_id, record_id
            )));
        }
        if entry.embedding.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "embedding has {} dimensions, index expects {}",
                entry.embedding.len(),
                self.dimension
            )));
        }
        if !entry.consent_level.is_indexable() {
            return Err(Error::ConsentDenied(format!(
                "record {} at {} may not be embedded",
                record_id, entry.consent_level
            )));
        }
        Ok(())
    }

    /// Append entries for a record. Returns the number inserted.
    pub async fn insert(&self, record_id: &RecordId, mut entries: Vec<VectorEntry>) -> Result<usize> {
        for entry in &mut entries {
            self.check(entry, record_id)?;
            entry.tokens.sort_unstable();
            entry.tokens.dedup();
        }
        let count = entries.len();
        let mut segment = self.segment(record_id).write().await;
        segment
            .entries
            .entry(record_id.clone())
            .or_default()
            .extend(entries);
        Ok(count)
    }

    /// Replace all entries of a record
    pub async fn replace(&self, record_id: &RecordId, mut entries: Vec<VectorEntry>) -> Result<usize> {
        for entry in &mut entries {
            self.check(entry, record_id)?;
            entry.tokens.sort_unstable();
            entry.tokens.dedup();
        }
        let count = entries.len();
        let mut segment = self.segment(record_id).write().await;
        if entries.is_empty() {
            segment.entries.remove(record_id);
        } else {
            segment.entries.insert(record_id.clone(), entries);
        }
        Ok(count)
    }

    /// Remove every entry of a record. Returns the number removed.
    pub async fn remove(&self, record_id: &RecordId) -> usize {
        self.segment(record_id)
            .write()
            .await
            .entries
            .remove(record_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Remove the entries of a record matching `predicate`, returning them
    pub async fn remove_where<F>(&self, record_id: &RecordId, predicate: F) -> Vec<VectorEntry>
    where
        F: Fn(&VectorEntry) -> bool,
    {
        let mut segment = self.segment(record_id).write().await;
        let Some(list) = segment.entries.get_mut(record_id) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|e| predicate(e));
        if kept.is_empty() {
            segment.entries.remove(record_id);
        } else {
            *list = kept;
        }
        removed
    }

    /// Entries of a record
    pub async fn entries_for(&self, record_id: &RecordId) -> Vec<VectorEntry> {
        self.segment(record_id)
            .read()
            .await
            .entries
            .get(record_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of entries of a record
    pub async fn count_for(&self, record_id: &RecordId) -> usize {
        self.segment(record_id)
            .read()
            .await
            .entries
            .get(record_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total number of entries
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for segment in &self.segments {
            total += segment.read().await.entries.values().map(Vec::len).sum::<usize>();
        }
        total
    }

    /// Whether the index holds no entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// First phase of a delete: hide the record from search
    pub async fn mark_for_delete(&self, record_id: &RecordId) {
        self.marked.write().await.insert(record_id.clone());
    }

    /// Abort a delete
    pub async fn unmark(&self, record_id: &RecordId) {
        self.marked.write().await.remove(record_id);
    }

    /// Last phase of a delete: drop the entries and the mark
    pub async fn finalize_delete(&self, record_id: &RecordId) -> usize {
        let removed = self.remove(record_id).await;
        self.marked.write().await.remove(record_id);
        removed
    }

    /// Records with a pending delete
    pub async fn marked(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.marked.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Semantic search: at most `k` hits by descending cosine similarity.
    /// `filter` runs before scoring, so excluded entries never influence
    /// the ranking. An empty index yields an empty list.
    pub async fn search(&self, query: &[f32], k: usize, filter: EntryFilter<'_>) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        self.scan(k, filter, |entry| Some(dot(&entry.embedding, query)))
            .await
    }

    /// Keyword search over token tags; only spans sharing at least one
    /// token are returned
    pub async fn keyword_search(
        &self,
        query_tokens: &BTreeSet<u64>,
        k: usize,
        filter: EntryFilter<'_>,
    ) -> Result<Vec<SearchHit>> {
        self.scan(k, filter, |entry| {
            let score = overlap_score(query_tokens, &entry.tokens);
            (score > 0.0).then_some(score)
        })
        .await
    }

    async fn scan<S>(&self, k: usize, filter: EntryFilter<'_>, score: S) -> Result<Vec<SearchHit>>
    where
        S: Fn(&VectorEntry) -> Option<f32>,
    {
        if k == 0 {
            return Ok(Vec::new());
        }
        let marked = self.marked.read().await.clone();
        let mut hits = Vec::new();
        for segment in &self.segments {
            let segment = segment.read().await;
            for (record_id, entries) in &segment.entries {
                if marked.contains(record_id) {
                    continue;
                }
                for entry in entries.iter().filter(|e| filter(e)) {
                    if let Some(s) = score(entry) {
                        hits.push(SearchHit::from_entry(entry, s));
                    }
                }
            }
        }
        hits.sort_by(|a, b| rank_order(a.score, a, b.score, b));
        hits.truncate(k);
        Ok(hits)
    }

    /// Every entry, ordered by record id then span, for persistence
    pub async fn snapshot(&self) -> Vec<VectorEntry> {
        let mut all = Vec::new();
        for segment in &self.segments {
            let segment = segment.read().await;
            for entries in segment.entries.values() {
                all.extend(entries.iter().cloned());
            }
        }
        all.sort_by(|a, b| a.record_id.cmp(&b.record_id).then(a.span.cmp(&b.span)));
        all
    }

    /// Restore entries and pending marks from a snapshot
    pub async fn restore(&self, entries: Vec<VectorEntry>, marked: Vec<RecordId>) -> Result<()> {
        let mut grouped: HashMap<RecordId, Vec<VectorEntry>> = HashMap::new();
        for entry in entries {
            grouped.entry(entry.record_id.clone()).or_default().push(entry);
        }
        for (record_id, entries) in grouped {
            self.replace(&record_id, entries).await?;
        }
        self.marked.write().await.extend(marked);
        Ok(())
    }
}
