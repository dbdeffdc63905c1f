//! Portable bundle archive
//!
//! Directory layout:
//! ```text
//! <archive>/
//! ├── manifest.json        schema version, bundle name, owner, timestamps
//! ├── policy.json          bundle consent policy
//! ├── keys.json            data keys wrapped under a passphrase key
//! ├── index.json           span embeddings and labels
//! └── records/
//!     ├── <record-id>.json encrypted records
//!     └── ...
//! ```
//!
//! `manifest.json` is written last, so an interrupted export is never
//! mistaken for a complete archive.

use super::types::BundlePolicy;
use crate::crypto::{b64, WrappedKey};
use crate::error::{Error, Result};
use crate::index::VectorEntry;
use crate::persist::{read_json, read_json_dir, write_json};
use crate::store::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Archive format version written by this build
pub const SCHEMA_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const POLICY_FILE: &str = "policy.json";
const KEYS_FILE: &str = "keys.json";
const INDEX_FILE: &str = "index.json";
const RECORDS_DIR: &str = "records";

/// Archive manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version
    pub schema_version: u32,
    /// Exported bundle
    pub bundle_name: String,
    /// Owner at export time
    pub owner_id: String,
    /// Bundle creation time
    pub created_at: DateTime<Utc>,
    /// Export time
    pub exported_at: DateTime<Utc>,
    /// Bundle version at export
    pub bundle_version: u64,
    /// Number of records
    pub record_count: usize,
    /// Number of index entries
    pub passage_count: usize,
    /// Bundle records left out because their data key was erased
    #[serde(default)]
    pub skipped_records: usize,
    /// Embedder that produced the index
    pub embedder: String,
    /// Embedding dimension
    pub dimension: usize,
}

/// Data keys needed to open the archived records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysFile {
    /// PBKDF2 salt for the passphrase key
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// PBKDF2 iterations
    pub kdf_iterations: u32,
    /// Wrapped data keys
    pub keys: Vec<WrappedKey>,
}

/// In-memory form of an archive
#[derive(Debug, Clone)]
pub struct Archive {
    /// Manifest
    pub manifest: Manifest,
    /// Consent policy
    pub policy: BundlePolicy,
    /// Encrypted records
    pub records: Vec<Record>,
    /// Index entries; keyword tags are not exported
    pub entries: Vec<VectorEntry>,
    /// Wrapped keys
    pub keys: KeysFile,
}

impl Archive {
    /// Write the archive into `dir`, which must not already hold one
    pub async fn write(&self, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir.join(MANIFEST_FILE)).await? {
            return Err(Error::Conflict(format!(
                "{} already contains an archive",
                dir.display()
            )));
        }
        let records_dir = dir.join(RECORDS_DIR);
        tokio::fs::create_dir_all(&records_dir).await?;

        for record in &self.records {
            write_json(&records_dir.join(format!("{}.json", record.id)), record).await?;
        }
        write_json(&dir.join(INDEX_FILE), &self.entries).await?;
        write_json(&dir.join(POLICY_FILE), &self.policy).await?;
        write_json(&dir.join(KEYS_FILE), &self.keys).await?;
        write_json(&dir.join(MANIFEST_FILE), &self.manifest).await?;
        Ok(())
    }

    /// Read an archive.
    ///
    /// The schema version is checked before anything else is parsed, so an
    /// archive from an unknown format fails with
    /// [`Error::SchemaVersionMismatch`] rather than a parse error.
    pub async fn read(dir: &Path) -> Result<Self> {
        let manifest = read_manifest(dir).await?;

        let policy = read_json(&dir.join(POLICY_FILE))
            .await?
            .ok_or_else(|| missing(dir, POLICY_FILE))?;
        let keys = read_json(&dir.join(KEYS_FILE))
            .await?
            .ok_or_else(|| missing(dir, KEYS_FILE))?;
        let entries = read_json(&dir.join(INDEX_FILE))
            .await?
            .ok_or_else(|| missing(dir, INDEX_FILE))?;
        let records: Vec<Record> = read_json_dir(&dir.join(RECORDS_DIR)).await?;

        if records.len() != manifest.record_count {
            return Err(Error::Validation(format!(
                "archive lists {} records but contains {}",
                manifest.record_count,
                records.len()
            )));
        }

        Ok(Self {
            manifest,
            policy,
            records,
            entries,
            keys,
        })
    }
}

/// Read and version-check the manifest only
pub async fn read_manifest(dir: &Path) -> Result<Manifest> {
    let raw: serde_json::Value = read_json(&dir.join(MANIFEST_FILE))
        .await?
        .ok_or_else(|| Error::NotFound(format!("no archive manifest in {}", dir.display())))?;

    let found = raw
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| Error::Validation("manifest has no schema_version".to_string()))?;
    if found != u64::from(SCHEMA_VERSION) {
        return Err(Error::SchemaVersionMismatch {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            supported: SCHEMA_VERSION,
        });
    }
    Ok(serde_json::from_value(raw)?)
}

fn missing(dir: &Path, file: &str) -> Error {
    Error::Validation(format!("archive {} is missing {}", dir.display(), file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::tests::test_record;

    fn archive() -> Archive {
        let record = test_record("alice", "bundle:b", "text");
        Archive {
            manifest: Manifest {
                schema_version: SCHEMA_VERSION,
                bundle_name: "b".to_string(),
                owner_id: "alice".to_string(),
                created_at: Utc::now(),
                exported_at: Utc::now(),
                bundle_version: 2,
                record_count: 1,
                passage_count: 0,
                skipped_records: 0,
                embedder: "hashing".to_string(),
                dimension: 8,
            },
            policy: BundlePolicy::default(),
            records: vec![record],
            entries: Vec::new(),
            keys: KeysFile {
                salt: vec![1, 2, 3],
                kdf_iterations: 1000,
                keys: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let original = archive();
        original.write(dir.path()).await.unwrap();

        let back = Archive::read(dir.path()).await.unwrap();
        assert_eq!(back.manifest, original.manifest);
        assert_eq!(back.records.len(), 1);
        assert_eq!(back.records[0].id, original.records[0].id);
        assert_eq!(back.keys.salt, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        archive().write(dir.path()).await.unwrap();
        assert!(matches!(
            archive().write(dir.path()).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        archive().write(dir.path()).await.unwrap();
        // A future format may change every other field
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"schema_version": 99, "layout": "v99"}"#,
        )
        .unwrap();

        assert!(matches!(
            Archive::read(dir.path()).await,
            Err(Error::SchemaVersionMismatch {
                found: 99,
                supported: SCHEMA_VERSION
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(Archive::read(dir.path()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_count_checked() {
        let dir = tempfile::tempdir().unwrap();
        archive().write(dir.path()).await.unwrap();
        std::fs::remove_dir_all(dir.path().join(RECORDS_DIR)).unwrap();
        assert!(matches!(Archive::read(dir.path()).await, Err(Error::Validation(_))));
    }
}
