//! Content-addressable record store
//!
//! Records are keyed by their content hash. A second `put` of the same
//! content appends provenance under the write lock instead of creating a
//! new row, so concurrent ingestion of identical content never loses an
//! entry.

use super::record::{Provenance, Record, RecordId};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of [`ContentStore::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Record id
    pub id: RecordId,
    /// True when the content was already stored
    pub duplicate: bool,
    /// Provenance length after the put
    pub provenance_len: usize,
}

/// In-memory content-addressable store
pub struct ContentStore {
    records: Arc<RwLock<HashMap<RecordId, Record>>>,
}

impl ContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a record. Idempotent: identical content returns the existing
    /// id and appends the new provenance entries.
    pub async fn put(&self, record: Record) -> Result<PutResult> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get_mut(&record.id) {
            if existing.owner_id != record.owner_id {
                return Err(Error::Internal(format!(
                    "record {} already held by another owner",
                    record.id
                )));
            }
            existing.provenance.extend(record.provenance);
            return Ok(PutResult {
                id: existing.id.clone(),
                duplicate: true,
                provenance_len: existing.provenance.len(),
            });
        }

        let result = PutResult {
            id: record.id.clone(),
            duplicate: false,
            provenance_len: record.provenance.len(),
        };
        records.insert(record.id.clone(), record);
        Ok(result)
    }

    /// Append one provenance entry to an existing record
    pub async fn append_provenance(&self, id: &RecordId, provenance: Provenance) -> Result<usize> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;
        record.provenance.push(provenance);
        Ok(record.provenance.len())
    }

    /// Fetch a record for `requester`, who must own it or have been granted
    /// access
    pub async fn get(&self, id: &RecordId, requester: &str) -> Result<Record> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;
        if !record.is_readable_by(requester) {
            return Err(Error::AccessDenied(format!(
                "{} may not read record {}",
                requester, id
            )));
        }
        Ok(record.clone())
    }

    /// Fetch a record without an owner check, for internal maintenance
    pub(crate) async fn get_unchecked(&self, id: &RecordId) -> Option<Record> {
        self.records.read().await.get(id).cloned()
    }

    /// Whether a record exists
    pub async fn contains(&self, id: &RecordId) -> bool {
        self.records.read().await.contains_key(id)
    }

    /// Delete a record together with its index entries.
    ///
    /// Runs as a saga: the record is first hidden from search, then the
    /// blob is removed, then the index entries. A crash in between leaves
    /// a mark that [`reconcile`](Self::reconcile) completes. Returns the
    /// number of index entries removed.
    pub async fn delete(&self, id: &RecordId, index: &VectorIndex) -> Result<usize> {
        if !self.contains(id).await {
            return Err(Error::NotFound(format!("record {}", id)));
        }
        index.mark_for_delete(id).await;
        self.records.write().await.remove(id);
        let removed = index.finalize_delete(id).await;
        tracing::debug!(record_id = %id, removed_passages = removed, "Deleted record");
        Ok(removed)
    }

    /// Complete every delete left half-done in `index`. Returns the ids
    /// that were finalized.
    pub async fn reconcile(&self, index: &VectorIndex) -> Vec<RecordId> {
        let marked = index.marked().await;
        for id in &marked {
            self.records.write().await.remove(id);
            index.finalize_delete(id).await;
        }
        if !marked.is_empty() {
            tracing::info!(count = marked.len(), "Completed interrupted deletes");
        }
        marked
    }

    /// Grant `grantee` read access to a record owned by `owner_id`
    pub async fn share(&self, id: &RecordId, owner_id: &str, grantee: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;
        if record.owner_id != owner_id {
            return Err(Error::AccessDenied(format!(
                "only the owner may share record {}",
                id
            )));
        }
        record.shared_with.insert(grantee.to_string());
        Ok(())
    }

    /// Apply `f` to a stored record under the write lock, returning the
    /// updated copy
    pub async fn update<F>(&self, id: &RecordId, f: F) -> Result<Record>
    where
        F: FnOnce(&mut Record) -> Result<()>,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;
        let mut updated = record.clone();
        f(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }

    /// Records owned by `owner_id`, ordered by id
    pub async fn list_by_owner(&self, owner_id: &str) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Every record, ordered by id
    pub async fn all(&self) -> Vec<Record> {
        let mut out: Vec<Record> = self.records.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Replace the store contents, e.g. after loading from disk
    pub async fn load(&self, records: Vec<Record>) {
        let mut map = self.records.write().await;
        map.clear();
        for record in records {
            map.insert(record.id.clone(), record);
        }
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::vector::tests::entry;
    use crate::store::record::tests::test_record;
    use chrono::Utc;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = ContentStore::new();
        let record = test_record("alice", "journal", "hello");
        let id = record.id.clone();

        let result = store.put(record).await.unwrap();
        assert!(!result.duplicate);
        assert_eq!(result.provenance_len, 1);

        let fetched = store.get(&id, "alice").await.unwrap();
        assert_eq!(fetched.source, "journal");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = ContentStore::new();
        let first = store.put(test_record("alice", "journal", "hello")).await.unwrap();
        let second = store.put(test_record("alice", "journal", "hello")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.duplicate);
        assert_eq!(second.provenance_len, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let store = ContentStore::new();
        let record = test_record("alice", "journal", "hello");
        let id = record.id.clone();
        store.put(record).await.unwrap();

        assert!(matches!(store.get(&id, "bob").await, Err(Error::AccessDenied(_))));
        assert!(matches!(
            store.share(&id, "bob", "bob").await,
            Err(Error::AccessDenied(_))
        ));

        store.share(&id, "alice", "bob").await.unwrap();
        assert!(store.get(&id, "bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = ContentStore::new();
        let id = RecordId::compute("alice", "journal", "missing");
        assert!(matches!(store.get(&id, "alice").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_index() {
        let store = ContentStore::new();
        let index = VectorIndex::new(2, 4);
        let record = test_record("alice", "journal", "hello");
        let id = record.id.clone();
        store.put(record).await.unwrap();

        let mut e = entry("aa", 0, vec![1.0, 0.0]);
        e.record_id = id.clone();
        index.insert(&id, vec![e]).await.unwrap();

        assert_eq!(store.delete(&id, &index).await.unwrap(), 1);
        assert!(!store.contains(&id).await);
        assert_eq!(index.count_for(&id).await, 0);
        assert!(index.marked().await.is_empty());
        assert!(matches!(store.delete(&id, &index).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reconcile_completes_marked_delete() {
        let store = ContentStore::new();
        let index = VectorIndex::new(2, 4);
        let record = test_record("alice", "journal", "hello");
        let id = record.id.clone();
        store.put(record).await.unwrap();

        let mut e = entry("aa", 0, vec![1.0, 0.0]);
        e.record_id = id.clone();
        index.insert(&id, vec![e]).await.unwrap();

        // Interrupted after the first saga step
        index.mark_for_delete(&id).await;

        assert_eq!(store.reconcile(&index).await, vec![id.clone()]);
        assert!(!store.contains(&id).await);
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_put_keeps_all_provenance() {
        let store = Arc::new(ContentStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put(test_record("alice", "journal", "same text")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = store.list_by_owner("alice").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provenance.len(), 16);
    }

    #[tokio::test]
    async fn test_append_and_update() {
        let store = ContentStore::new();
        let record = test_record("alice", "journal", "hello");
        let id = record.id.clone();
        store.put(record).await.unwrap();

        let len = store
            .append_provenance(&id, Provenance::now(Utc::now(), Some("b".to_string())))
            .await
            .unwrap();
        assert_eq!(len, 2);

        let updated = store
            .update(&id, |r| {
                r.consent_level = crate::consent::ConsentLevel::Anonymized;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.consent_level, crate::consent::ConsentLevel::Anonymized);

        let failed = store
            .update(&id, |_| Err(Error::Internal("boom".to_string())))
            .await;
        assert!(failed.is_err());
        assert_eq!(
            store.get_unchecked(&id).await.unwrap().consent_level,
            crate::consent::ConsentLevel::Anonymized
        );
    }
}
