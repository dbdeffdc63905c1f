//! Hybrid semantic + keyword retrieval
//!
//! Consent and scope filters run inside the index scan, before any
//! candidate is scored, so excluded content never influences the ranking.
//! Winning passages are re-fetched from the store and re-checked at read
//! time; anything that no longer passes is dropped.

use super::fusion::reciprocal_rank_fusion;
use super::{Passage, RetrievalFilter};
use crate::config::RetrievalConfig;
use crate::consent::{ConsentLevel, RecordView};
use crate::corpus::Corpus;
use crate::error::Result;
use crate::index::{Embedder, SearchHit, VectorEntry};
use crate::store::RecordId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Retriever over a corpus
pub struct HybridRetriever {
    corpus: Corpus,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    /// Create a retriever
    pub fn new(corpus: Corpus, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            corpus,
            embedder,
            config,
        }
    }

    /// Retrieve at most `k` passages readable by `requester`.
    ///
    /// Never fails: backend errors degrade to fewer or no passages.
    /// `scope`, when given, restricts candidates to those record ids.
    pub async fn retrieve(
        &self,
        requester: &str,
        query: &str,
        k: usize,
        filter: &RetrievalFilter,
        scope: Option<&HashSet<RecordId>>,
    ) -> Vec<Passage> {
        match self.try_retrieve(requester, query, k, filter, scope).await {
            Ok(passages) => passages,
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval degraded to empty result");
                Vec::new()
            }
        }
    }

    async fn try_retrieve(
        &self,
        requester: &str,
        query: &str,
        k: usize,
        filter: &RetrievalFilter,
        scope: Option<&HashSet<RecordId>>,
    ) -> Result<Vec<Passage>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let candidates = k.saturating_mul(self.config.candidate_multiplier);
        let query_tokens = self.corpus.hasher.token_set(query);

        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(embedder = self.embedder.name(), error = %e, "Semantic search unavailable");
                None
            }
        };

        let (semantic, keyword) = {
            let gate = self.corpus.gate.read().await;
            let admit = |entry: &VectorEntry| {
                entry.owner_id == requester
                    && gate
                        .read_view(&entry.source, entry.consent_level)
                        .exposes_content()
                    && scope.map_or(true, |ids| ids.contains(&entry.record_id))
                    && filter.matches(entry)
            };

            let semantic = match &query_vector {
                Some(vector) => self.corpus.index.search(vector, candidates, &admit).await?,
                None => Vec::new(),
            };
            let keyword = self
                .corpus
                .index
                .keyword_search(&query_tokens, candidates, &admit)
                .await?;
            (semantic, keyword)
        };

        let fused = reciprocal_rank_fusion(&semantic, &keyword, &self.config);
        tracing::debug!(
            semantic = semantic.len(),
            keyword = keyword.len(),
            fused = fused.len(),
            "Fused candidates"
        );
        Ok(self.materialize(requester, fused, k).await)
    }

    /// Turn ranked hits into passages, re-checking each against the store
    async fn materialize(&self, requester: &str, hits: Vec<SearchHit>, k: usize) -> Vec<Passage> {
        let mut loaded: HashMap<RecordId, Option<Readable>> = HashMap::new();
        let mut rendered: HashMap<(RecordId, ConsentLevel), String> = HashMap::new();
        let mut passages = Vec::new();

        for hit in hits {
            if passages.len() >= k {
                break;
            }
            if !loaded.contains_key(&hit.record_id) {
                let readable = self.load(requester, &hit.record_id).await;
                loaded.insert(hit.record_id.clone(), readable);
            }
            let Some(Some(readable)) = loaded.get(&hit.record_id) else {
                continue;
            };

            // Spans index into the view they were cut from
            let base = rendered
                .entry((hit.record_id.clone(), hit.consent_level))
                .or_insert_with(|| self.corpus.render(readable.plaintext.clone(), hit.consent_level));
            let Some(slice) = base.get(hit.span.start..hit.span.end) else {
                tracing::debug!(record_id = %hit.record_id, "Dropped stale span");
                continue;
            };
            // A policy lowered since indexing applies to the cut span
            let text = if readable.level < hit.consent_level {
                self.corpus.render(slice.to_string(), readable.level)
            } else {
                slice.to_string()
            };

            passages.push(Passage {
                text,
                record_id: hit.record_id,
                span: hit.span,
                label: hit.label,
                source: readable.source.clone(),
                event_time: hit.event_time,
                score: hit.score,
            });
        }
        passages
    }

    /// Decrypt a record for `requester`, or `None` when it may not be
    /// surfaced
    async fn load(&self, requester: &str, id: &RecordId) -> Option<Readable> {
        let record = match self.corpus.store.get(id, requester).await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(record_id = %id, error = %e, "Dropped passage at read time");
                return None;
            }
        };
        let level = match self.corpus.current_view(&record).await {
            RecordView::Full => ConsentLevel::Full,
            RecordView::Anonymized => ConsentLevel::Anonymized,
            RecordView::MetadataOnly | RecordView::Deny => return None,
        };
        match self
            .corpus
            .crypto
            .decrypt_text(&record.envelope, &record.owner_id)
            .await
        {
            Ok(plaintext) => Some(Readable {
                plaintext,
                source: record.source,
                level,
            }),
            Err(e) => {
                tracing::warn!(record_id = %id, error = %e, "Failed to open record during retrieval");
                None
            }
        }
    }
}

/// A record re-checked at read time
struct Readable {
    plaintext: String,
    source: String,
    level: ConsentLevel,
}
