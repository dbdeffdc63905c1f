//! Keyword tokens for lexical search
//!
//! The index never holds plaintext tokens: each token is reduced to a
//! 64-bit HMAC-SHA256 tag under the vault's index key.

use crate::crypto::KeyMaterial;
use ring::hmac;
use std::collections::BTreeSet;

/// Lowercase alphanumeric tokens of at least two characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Keyed token hasher
pub struct KeywordHasher {
    key: hmac::Key,
}

impl KeywordHasher {
    /// Create a hasher from the index key
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes()),
        }
    }

    /// Tag for a single token
    pub fn hash_token(&self, token: &str) -> u64 {
        let tag = hmac::sign(&self.key, token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&tag.as_ref()[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Distinct token tags of a text, sorted
    pub fn token_set(&self, text: &str) -> BTreeSet<u64> {
        tokenize(text).iter().map(|t| self.hash_token(t)).collect()
    }
}

/// Fraction of distinct query tokens present in a span (0.0 – 1.0)
pub fn overlap_score(query: &BTreeSet<u64>, span_tokens: &[u64]) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let common = query
        .iter()
        .filter(|t| span_tokens.binary_search(t).is_ok())
        .count();
    common as f32 / query.len() as f32
}
