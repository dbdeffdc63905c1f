//! Append-only audit log
//!
//! Every ingestion, read, consent change, purge, export and import is
//! recorded with its outcome. Entries are appended to a JSON lines file;
//! only the most recent ones stay in memory.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Bundle created
    CreateBundle,
    /// Record ingested
    Ingest,
    /// Record read by id
    Read,
    /// Passages retrieved
    Retrieve,
    /// Consent level changed
    ConsentChange,
    /// Record shared with another owner
    Share,
    /// Pattern purge
    Purge,
    /// Retention sweep removed or downgraded a record
    Retention,
    /// Bundle exported
    Export,
    /// Bundle imported
    Import,
    /// Data key rotated
    KeyRotation,
    /// Data key erased and its records deleted
    KeyErasure,
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened
    pub at: DateTime<Utc>,
    /// Acting owner
    pub owner_id: String,
    /// What was done
    pub action: AuditAction,
    /// Record id, bundle name or key id acted on
    pub target: String,
    /// Whether the action succeeded
    pub success: bool,
    /// Outcome summary or error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    /// Entry for an action happening now
    pub fn new(owner_id: impl Into<String>, action: AuditAction, target: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            owner_id: owner_id.into(),
            action,
            target: target.into(),
            success: true,
            detail: None,
        }
    }

    /// Attach a detail message
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Mark as failed with the given reason
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.detail = Some(reason.into());
        self
    }
}

/// Entries kept in memory when no limit is configured
pub const DEFAULT_MEMORY_LIMIT: usize = 10_000;

#[derive(Default)]
struct LogState {
    /// Most recent entries, oldest first
    recent: VecDeque<AuditEntry>,
    /// Entries not yet appended to disk
    pending: Vec<AuditEntry>,
}

/// Audit log holding the most recent entries in memory.
///
/// A persistent log also queues every entry until [`flush`](Self::flush)
/// appends it to the JSON lines file, so the file keeps the full history
/// while memory stays bounded.
#[derive(Clone)]
pub struct AuditLog {
    state: Arc<RwLock<LogState>>,
    limit: usize,
    persistent: bool,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MEMORY_LIMIT)
    }
}

impl AuditLog {
    /// Create an empty in-memory log
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory log keeping at most `limit` entries
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(LogState::default())),
            limit: limit.max(1),
            persistent: false,
        }
    }

    /// Log whose entries are queued for [`flush`](Self::flush)
    pub fn persistent(limit: usize) -> Self {
        Self {
            persistent: true,
            ..Self::with_limit(limit)
        }
    }

    /// Append an entry
    pub async fn record(&self, entry: AuditEntry) {
        if !entry.success {
            tracing::debug!(action = ?entry.action, target = %entry.target, "Audited failure");
        }
        let mut state = self.state.write().await;
        if self.persistent {
            state.pending.push(entry.clone());
        }
        state.recent.push_back(entry);
        while state.recent.len() > self.limit {
            state.recent.pop_front();
        }
    }

    /// Entries for one owner still held in memory, oldest first
    pub async fn entries_for(&self, owner_id: &str) -> Vec<AuditEntry> {
        self.state
            .read()
            .await
            .recent
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Number of entries held in memory
    pub async fn len(&self) -> usize {
        self.state.read().await.recent.len()
    }

    /// Whether no entries are held in memory
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.recent.is_empty()
    }

    /// Number of entries waiting for [`flush`](Self::flush)
    pub async fn pending(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Serialize the in-memory entries as JSON lines
    pub async fn to_jsonl(&self) -> Result<String> {
        to_jsonl(self.state.read().await.recent.iter())
    }

    /// Append queued entries to `path`. Entries stay queued if the write
    /// fails.
    pub async fn flush(&self, path: &Path) -> Result<usize> {
        let pending = std::mem::take(&mut self.state.write().await.pending);
        if pending.is_empty() {
            return Ok(0);
        }
        match append_lines(path, &pending).await {
            Ok(()) => Ok(pending.len()),
            Err(e) => {
                let mut state = self.state.write().await;
                let newer = std::mem::replace(&mut state.pending, pending);
                state.pending.extend(newer);
                Err(e)
            }
        }
    }

    /// Parse a persisted log, skipping lines that do not parse. Only the
    /// last `limit` entries are kept in memory.
    pub fn from_jsonl(text: &str, limit: usize) -> Self {
        let log = Self::persistent(limit);
        let mut recent: VecDeque<AuditEntry> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping malformed audit line: {}", e);
                    None
                }
            })
            .collect();
        while recent.len() > log.limit {
            recent.pop_front();
        }
        Self {
            state: Arc::new(RwLock::new(LogState {
                recent,
                pending: Vec::new(),
            })),
            ..log
        }
    }
}

fn to_jsonl<'a>(entries: impl Iterator<Item = &'a AuditEntry>) -> Result<String> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    Ok(out)
}

async fn append_lines(path: &Path, entries: &[AuditEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = to_jsonl(entries.iter())?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_filter() {
        let log = AuditLog::new();
        log.record(AuditEntry::new("alice", AuditAction::Ingest, "r1")).await;
        log.record(AuditEntry::new("bob", AuditAction::Read, "r2").failed("access denied"))
            .await;

        let alice = log.entries_for("alice").await;
        assert_eq!(alice.len(), 1);
        assert!(alice[0].success);

        let bob = log.entries_for("bob").await;
        assert!(!bob[0].success);
        assert_eq!(bob[0].detail.as_deref(), Some("access denied"));
    }

    #[tokio::test]
    async fn test_jsonl_roundtrip_skips_garbage() {
        let log = AuditLog::new();
        log.record(AuditEntry::new("alice", AuditAction::Purge, "b").detail("removed 1"))
            .await;
        let text = format!("{}not json\n", log.to_jsonl().await.unwrap());

        let back = AuditLog::from_jsonl(&text, DEFAULT_MEMORY_LIMIT);
        let entries = back.entries_for("alice").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Purge);
        assert_eq!(back.pending().await, 0);
    }

    #[tokio::test]
    async fn test_memory_is_capped() {
        let log = AuditLog::with_limit(3);
        for i in 0..5 {
            log.record(AuditEntry::new("alice", AuditAction::Retrieve, format!("q{}", i)))
                .await;
        }
        let targets: Vec<String> = log
            .entries_for("alice")
            .await
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec!["q2", "q3", "q4"]);
        assert_eq!(log.pending().await, 0);
    }

    #[tokio::test]
    async fn test_flush_appends_only_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::persistent(2);

        log.record(AuditEntry::new("alice", AuditAction::Ingest, "r1")).await;
        log.record(AuditEntry::new("alice", AuditAction::Read, "r1")).await;
        assert_eq!(log.flush(&path).await.unwrap(), 2);
        assert_eq!(log.flush(&path).await.unwrap(), 0);

        log.record(AuditEntry::new("alice", AuditAction::Retrieve, "*")).await;
        assert_eq!(log.flush(&path).await.unwrap(), 1);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);

        let back = AuditLog::from_jsonl(&text, 2);
        let entries = back.entries_for("alice").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, AuditAction::Retrieve);
    }
}
