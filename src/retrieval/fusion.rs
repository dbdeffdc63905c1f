//! Weighted reciprocal-rank fusion

use crate::config::RetrievalConfig;
use crate::index::{rank_order, SearchHit, Span};
use crate::store::RecordId;
use std::collections::HashMap;

/// Fuse a semantic and a keyword ranking into one list.
///
/// A candidate at 1-based rank `r` in a list contributes
/// `weight / (rrf_k + r)`; contributions from both lists add up. The
/// result is in final order.
pub fn reciprocal_rank_fusion(
    semantic: &[SearchHit],
    keyword: &[SearchHit],
    config: &RetrievalConfig,
) -> Vec<SearchHit> {
    let mut fused: HashMap<(RecordId, Span), SearchHit> = HashMap::new();

    for (hits, weight) in [
        (semantic, config.semantic_weight),
        (keyword, config.keyword_weight),
    ] {
        for (rank, hit) in hits.iter().enumerate() {
            let contribution = weight / (config.rrf_k + rank as f32 + 1.0);
            fused
                .entry((hit.record_id.clone(), hit.span))
                .and_modify(|h| h.score += contribution)
                .or_insert_with(|| SearchHit {
                    score: contribution,
                    ..hit.clone()
                });
        }
    }

    let mut out: Vec<SearchHit> = fused.into_values().collect();
    out.sort_by(|a, b| rank_order(a.score, a, b.score, b));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::ConsentLevel;
    use chrono::Utc;

    fn hit(record: &str, start: usize, score: f32) -> SearchHit {
        SearchHit {
            record_id: RecordId::from_hex(record),
            span: Span::new(start, start + 5),
            label: None,
            event_time: Utc::now(),
            consent_level: ConsentLevel::Full,
            score,
        }
    }

    #[test]
    fn test_agreement_wins() {
        let config = RetrievalConfig::default();
        let semantic = vec![hit("aa", 0, 0.9), hit("bb", 0, 0.8)];
        let keyword = vec![hit("bb", 0, 1.0), hit("cc", 0, 0.5)];

        let fused = reciprocal_rank_fusion(&semantic, &keyword, &config);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].record_id.as_str(), "bb");
        let expected = 0.7 / 62.0 + 0.3 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_semantic_weight_dominates_single_lists() {
        let config = RetrievalConfig::default();
        let fused = reciprocal_rank_fusion(&[hit("aa", 0, 0.1)], &[hit("bb", 0, 1.0)], &config);
        assert_eq!(fused[0].record_id.as_str(), "aa");
    }

    #[test]
    fn test_spans_fused_separately() {
        let config = RetrievalConfig::default();
        let fused = reciprocal_rank_fusion(&[hit("aa", 0, 0.9), hit("aa", 10, 0.8)], &[], &config);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].span.start, 0);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(reciprocal_rank_fusion(&[], &[], &RetrievalConfig::default()).is_empty());
    }
}
