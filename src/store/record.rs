//! Record data types
//!
//! A record is the atomic unit of captured experience. Its id is the hash of
//! the normalized text, owner and source, so identical content collapses to
//! one record while every ingestion is kept as a provenance entry.

use crate::consent::ConsentLevel;
use crate::crypto::Envelope;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Content hash identifying a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Hash of `(owner_id, source, normalized_text)`
    pub fn compute(owner_id: &str, source: &str, normalized_text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(owner_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalized_text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already computed hex id
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Parse user input, requiring a full lowercase SHA-256 hex digest
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::Validation(format!("'{}' is not a record id", s)))
        }
    }

    /// Hex string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize text before hashing and storage: unify line endings, strip
/// trailing whitespace on each line and surrounding blank space.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Normalized tuple accepted from format parsers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Origin identifier, e.g. `email` or `journal`
    pub source: String,
    /// When the original event happened
    pub timestamp: DateTime<Utc>,
    /// Text content
    pub text: String,
    /// Parser-supplied metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl IngestRequest {
    /// Create a request with no metadata
    pub fn new(source: impl Into<String>, timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp,
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One ingestion of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Ingestion batch
    pub batch_id: Uuid,
    /// When this ingestion happened
    pub ingested_at: DateTime<Utc>,
    /// Event time reported by this ingestion
    pub event_time: DateTime<Utc>,
    /// Bundle that meditated the record, if any
    #[serde(default)]
    pub bundle: Option<String>,
}

impl Provenance {
    /// Provenance entry for an ingestion happening now
    pub fn now(event_time: DateTime<Utc>, bundle: Option<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            ingested_at: Utc::now(),
            event_time,
            bundle,
        }
    }
}

/// A stored record: ciphertext plus an unencrypted provenance envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Content hash
    pub id: RecordId,
    /// Owning person
    pub owner_id: String,
    /// Origin identifier
    pub source: String,
    /// When the original event happened
    pub timestamp: DateTime<Utc>,
    /// Consent level fixed at ingestion
    pub consent_level: ConsentLevel,
    /// Encrypted normalized text
    pub envelope: Envelope,
    /// Length of the normalized text in characters
    pub char_count: usize,
    /// Parser-supplied metadata (unencrypted)
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Every ingestion of this content, oldest first
    pub provenance: Vec<Provenance>,
    /// Other owners granted read access
    #[serde(default)]
    pub shared_with: BTreeSet<String>,
    /// Structural labels removed by a purge; never indexed again
    #[serde(default)]
    pub purged_labels: BTreeSet<String>,
}

impl Record {
    /// When the record first entered the store
    pub fn first_ingested_at(&self) -> DateTime<Utc> {
        self.provenance
            .first()
            .map(|p| p.ingested_at)
            .unwrap_or(self.timestamp)
    }

    /// Whether `requester` owns or was granted this record
    pub fn is_readable_by(&self, requester: &str) -> bool {
        self.owner_id == requester || self.shared_with.contains(requester)
    }

    /// Searchable metadata strings: `source` plus `key=value` for every entry
    pub fn metadata_strings(&self) -> Vec<String> {
        let mut out = vec![self.source.clone()];
        for (key, value) in &self.metadata {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(format!("{}={}", key, value));
        }
        out
    }
}

/// Builder for constructing `Record` instances
pub struct RecordBuilder {
    id: Option<RecordId>,
    owner_id: Option<String>,
    source: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    consent_level: ConsentLevel,
    envelope: Option<Envelope>,
    char_count: usize,
    metadata: BTreeMap<String, serde_json::Value>,
    provenance: Vec<Provenance>,
}

impl RecordBuilder {
    /// Create a new builder for the given content id
    pub fn new(id: RecordId) -> Self {
        Self {
            id: Some(id),
            owner_id: None,
            source: None,
            timestamp: None,
            consent_level: ConsentLevel::MetadataOnly,
            envelope: None,
            char_count: 0,
            metadata: BTreeMap::new(),
            provenance: Vec::new(),
        }
    }

    /// Set owner
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Set source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set event timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set consent level
    pub fn consent_level(mut self, level: ConsentLevel) -> Self {
        self.consent_level = level;
        self
    }

    /// Set encrypted content
    pub fn envelope(mut self, envelope: Envelope, char_count: usize) -> Self {
        self.envelope = Some(envelope);
        self.char_count = char_count;
        self
    }

    /// Replace metadata
    pub fn metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a provenance entry
    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance.push(provenance);
        self
    }

    /// Build the record, returning an error if required fields are missing
    pub fn build(self) -> Result<Record> {
        let id = self
            .id
            .ok_or_else(|| Error::Validation("id is required".to_string()))?;
        let owner_id = self
            .owner_id
            .ok_or_else(|| Error::Validation("owner_id is required".to_string()))?;
        let source = self
            .source
            .ok_or_else(|| Error::Validation("source is required".to_string()))?;
        let timestamp = self
            .timestamp
            .ok_or_else(|| Error::Validation("timestamp is required".to_string()))?;
        let envelope = self
            .envelope
            .ok_or_else(|| Error::Validation("encrypted content is required".to_string()))?;
        if self.consent_level == ConsentLevel::None {
            return Err(Error::ConsentDenied(format!(
                "record {} resolved to consent level none",
                id
            )));
        }

        Ok(Record {
            id,
            owner_id,
            source,
            timestamp,
            consent_level: self.consent_level,
            envelope,
            char_count: self.char_count,
            metadata: self.metadata,
            provenance: self.provenance,
            shared_with: BTreeSet::new(),
            purged_labels: BTreeSet::new(),
        })
    }
}
