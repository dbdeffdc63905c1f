//! Bundle data types and operation reports

use crate::consent::{ConsentLevel, RecordView, SourcePolicy};
use crate::error::{Error, Result};
use crate::store::{Provenance, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Source namespace shared by all bundles
pub const BUNDLE_NAMESPACE: &str = "bundle";

/// Consent policy of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePolicy {
    /// Level granted to meditated records
    pub default_level: ConsentLevel,
    /// Records older than this are removed by the retention sweep
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// FULL records older than this are downgraded to ANONYMIZED
    #[serde(default)]
    pub downgrade_after_days: Option<u32>,
}

impl BundlePolicy {
    /// Policy granting `level` with no retention limits
    pub fn new(default_level: ConsentLevel) -> Self {
        Self {
            default_level,
            retention_days: None,
            downgrade_after_days: None,
        }
    }

    /// Set retention in days
    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    /// Set the downgrade age in days
    pub fn downgrade_after_days(mut self, days: u32) -> Self {
        self.downgrade_after_days = Some(days);
        self
    }

    /// Gate policy for the bundle's source
    pub fn source_policy(&self, source: &str) -> SourcePolicy {
        SourcePolicy {
            source: source.to_string(),
            default_level: self.default_level,
            retention_days: self.retention_days,
            downgrade_after_days: self.downgrade_after_days,
        }
    }
}

impl Default for BundlePolicy {
    fn default() -> Self {
        Self::new(ConsentLevel::Full)
    }
}

/// Named, portable aggregate of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Bundle name (`[a-z0-9_-]+`)
    pub name: String,
    /// Owner of every record in the bundle
    pub owner_id: String,
    /// Consent policy
    pub policy: BundlePolicy,
    /// Attached records
    pub record_ids: BTreeSet<RecordId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Incremented on every change to the record set
    pub version: u64,
}

impl Bundle {
    /// Create an empty bundle, validating the name
    pub fn new(name: &str, owner_id: &str, policy: BundlePolicy) -> Result<Self> {
        validate_name(name)?;
        let now = Utc::now();
        Ok(Self {
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            policy,
            record_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// Source identifier of records meditated into this bundle
    pub fn source(&self) -> String {
        source_for(&self.name)
    }

    /// Attach a record; returns whether it was new
    pub fn attach(&mut self, id: RecordId) -> bool {
        let added = self.record_ids.insert(id);
        if added {
            self.touch();
        }
        added
    }

    /// Detach a record; returns whether it was attached
    pub fn detach(&mut self, id: &RecordId) -> bool {
        let removed = self.record_ids.remove(id);
        if removed {
            self.touch();
        }
        removed
    }

    pub(crate) fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// Source identifier for a bundle name
pub fn source_for(name: &str) -> String {
    format!("{}:{}", BUNDLE_NAMESPACE, name)
}

/// Check a bundle name against `[a-z0-9_-]+`
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "bundle name '{}' must match [a-z0-9_-]+ (at most 64 characters)",
            name
        )))
    }
}

/// Source material for `meditate`
#[derive(Debug, Clone)]
pub enum MeditateInput {
    /// Inline text
    Text(String),
    /// A UTF-8 text file
    File(PathBuf),
}

/// Outcome of one ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Record id
    pub record_id: RecordId,
    /// Level the caller asked for
    pub requested_level: ConsentLevel,
    /// Level actually stored
    pub applied_level: ConsentLevel,
    /// True when the content was already stored
    pub duplicate: bool,
    /// Provenance entries after this ingestion
    pub provenance_len: usize,
    /// Index entries for the record after this ingestion
    pub passages: usize,
    /// Whether this ingestion wrote index entries
    pub newly_indexed: bool,
}

impl IngestReport {
    /// Whether the gate lowered the requested level
    pub fn downgraded(&self) -> bool {
        self.applied_level < self.requested_level
    }
}

/// Outcome of `meditate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeditateReport {
    /// Bundle meditated into
    pub bundle: String,
    /// Ingestion outcome
    pub ingest: IngestReport,
    /// Whether the record was newly attached to the bundle
    pub attached: bool,
}

/// Outcome of `purge`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Pattern applied
    pub pattern: String,
    /// Records matched by source, metadata or span label
    pub matched: usize,
    /// Records deleted from the store
    pub removed_records: usize,
    /// Records detached but kept because another bundle references them
    pub detached_records: usize,
    /// Index entries removed
    pub removed_passages: usize,
    /// Records left in the bundle
    pub retained: usize,
}

/// Summary returned by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleStatus {
    /// Bundle name
    pub name: String,
    /// Attached records
    pub documents: usize,
    /// Index entries across attached records
    pub passages: usize,
    /// Consent policy
    pub policy: BundlePolicy,
    /// Record set version
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// A record as its reader may see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordReadout {
    /// Record id
    pub record_id: RecordId,
    /// Origin identifier
    pub source: String,
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// Stored consent level
    pub consent_level: ConsentLevel,
    /// View granted to the reader
    pub view: RecordView,
    /// Unencrypted metadata
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Ingestion history
    pub provenance: Vec<Provenance>,
    /// Text in the granted view; `None` for METADATA_ONLY
    pub text: Option<String>,
}

/// Outcome of a retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Records deleted because their retention window passed
    pub expired: Vec<RecordId>,
    /// Records downgraded from FULL to ANONYMIZED
    pub downgraded: Vec<RecordId>,
    /// Data keys destroyed
    pub pruned_keys: Vec<String>,
    /// Records deleted because their data key was destroyed
    pub erased: Vec<RecordId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("jesus_christ").is_ok());
        assert!(validate_name("gospel-of-thomas2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Jesus").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_attach_detach_versioning() {
        let mut bundle = Bundle::new("b", "alice", BundlePolicy::default()).unwrap();
        let id = RecordId::from_hex("aa");
        assert_eq!(bundle.version, 1);

        assert!(bundle.attach(id.clone()));
        assert!(!bundle.attach(id.clone()));
        assert_eq!(bundle.version, 2);

        assert!(bundle.detach(&id));
        assert!(!bundle.detach(&id));
        assert_eq!(bundle.version, 3);
        assert_eq!(bundle.source(), "bundle:b");
    }

    #[test]
    fn test_source_policy() {
        let policy = BundlePolicy::new(ConsentLevel::Anonymized).retention_days(7);
        let source = policy.source_policy("bundle:b");
        assert_eq!(source.default_level, ConsentLevel::Anonymized);
        assert_eq!(source.retention_days, Some(7));
    }
}
