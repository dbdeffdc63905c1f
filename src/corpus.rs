//! Governed access to stored content
//!
//! A [`Corpus`] bundles the stores that every governed read or write has to
//! touch together: records, the vector index, the consent gate and the
//! encryption service. Cloning is cheap; all parts are shared.

use crate::consent::{Anonymizer, ConsentGate, ConsentLevel, RecordView};
use crate::crypto::EncryptionService;
use crate::error::Result;
use crate::index::{KeywordHasher, VectorIndex};
use crate::store::{ContentStore, Record};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Field name under which record text is encrypted
pub const CONTENT_FIELD: &str = "content";

/// Shared handles to the governed stores
#[derive(Clone)]
pub struct Corpus {
    /// Encrypted records
    pub store: Arc<ContentStore>,
    /// Span embeddings and keyword tags
    pub index: Arc<VectorIndex>,
    /// Source consent policies
    pub gate: Arc<RwLock<ConsentGate>>,
    /// Record encryption
    pub crypto: EncryptionService,
    /// Produces the ANONYMIZED view
    pub anonymizer: Arc<Anonymizer>,
    /// Keyed keyword tags
    pub hasher: Arc<KeywordHasher>,
}

impl Corpus {
    /// Assemble a corpus around an encryption service and consent gate
    pub async fn new(
        crypto: EncryptionService,
        gate: ConsentGate,
        dimension: usize,
        segments: usize,
    ) -> Result<Self> {
        let index_key = crypto.index_key().await?;
        Ok(Self {
            store: Arc::new(ContentStore::new()),
            index: Arc::new(VectorIndex::new(dimension, segments)),
            gate: Arc::new(RwLock::new(gate)),
            crypto,
            anonymizer: Arc::new(Anonymizer::with_defaults()?),
            hasher: Arc::new(KeywordHasher::new(&index_key)),
        })
    }

    /// View a reader may currently see of `record`
    pub async fn current_view(&self, record: &Record) -> RecordView {
        self.gate
            .read()
            .await
            .read_view(&record.source, record.consent_level)
    }

    /// Decrypt `record` and render the text visible at `level`.
    ///
    /// Returns `None` for levels that expose no content.
    pub async fn view_text(&self, record: &Record, level: ConsentLevel) -> Result<Option<String>> {
        if !level.is_indexable() {
            return Ok(None);
        }
        let text = self
            .crypto
            .decrypt_text(&record.envelope, &record.owner_id)
            .await?;
        Ok(Some(self.render(text, level)))
    }

    /// Render already decrypted text at `level`
    pub fn render(&self, text: String, level: ConsentLevel) -> String {
        if level == ConsentLevel::Full {
            text
        } else {
            self.anonymizer.anonymize(&text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyRing;
    use crate::store::{normalize_text, Provenance, RecordBuilder, RecordId};
    use chrono::Utc;

    async fn corpus() -> Corpus {
        let crypto = EncryptionService::new(KeyRing::generate(30));
        Corpus::new(crypto, ConsentGate::default(), 8, 2).await.unwrap()
    }

    async fn record(corpus: &Corpus, text: &str) -> Record {
        let normalized = normalize_text(text);
        let envelope = corpus
            .crypto
            .encrypt(normalized.as_bytes(), "alice", CONTENT_FIELD)
            .await
            .unwrap();
        RecordBuilder::new(RecordId::compute("alice", "email", &normalized))
            .owner_id("alice")
            .source("email")
            .timestamp(Utc::now())
            .consent_level(ConsentLevel::Full)
            .envelope(envelope, normalized.chars().count())
            .provenance(Provenance::now(Utc::now(), None))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_view_text_levels() {
        let corpus = corpus().await;
        let record = record(&corpus, "Write to jane@example.com").await;

        let full = corpus.view_text(&record, ConsentLevel::Full).await.unwrap();
        assert_eq!(full.as_deref(), Some("Write to jane@example.com"));

        let anon = corpus
            .view_text(&record, ConsentLevel::Anonymized)
            .await
            .unwrap()
            .unwrap();
        assert!(!anon.contains("jane@example.com"));

        assert!(corpus
            .view_text(&record, ConsentLevel::MetadataOnly)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_current_view_follows_policy() {
        let corpus = corpus().await;
        let record = record(&corpus, "hello").await;
        assert_eq!(corpus.current_view(&record).await, RecordView::Full);

        corpus
            .gate
            .write()
            .await
            .register(crate::consent::SourcePolicy::new("email", ConsentLevel::Anonymized));
        assert_eq!(corpus.current_view(&record).await, RecordView::Anonymized);
    }
}
