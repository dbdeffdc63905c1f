//! Consent Gate — evaluates per-source consent policy on writes and reads
//!
//! The gate never grants more than a source's registered default: the
//! caller's requested level and the source default are merged with
//! [`ConsentLevel::ratchet`], which always keeps the stricter of the two.

use super::level::ConsentLevel;
use crate::error::{Error, Result};
use crate::store::RecordId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How long an issued confirmation token stays valid
const CONFIRMATION_TTL_MINUTES: i64 = 10;

/// Consent policy registered for a source (or source namespace)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePolicy {
    /// Source identifier, e.g. `email` or `bundle:jesus_christ`
    pub source: String,
    /// Highest level the source may ever be granted
    pub default_level: ConsentLevel,
    /// Records older than this are destroyed by the retention sweep
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// FULL records older than this are downgraded to ANONYMIZED
    #[serde(default)]
    pub downgrade_after_days: Option<u32>,
}

impl SourcePolicy {
    /// Policy with no retention limits
    pub fn new(source: impl Into<String>, default_level: ConsentLevel) -> Self {
        Self {
            source: source.into(),
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

    /// Set the FULL → ANONYMIZED downgrade age in days
    pub fn downgrade_after_days(mut self, days: u32) -> Self {
        self.downgrade_after_days = Some(days);
        self
    }
}

/// Outcome of evaluating a write against the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    /// Level actually applied
    pub allowed_level: ConsentLevel,
    /// Retention window in days, if any
    pub retention_days: Option<u32>,
    /// True when the allowed level is lower than the requested level
    pub downgraded: bool,
}

/// The view of a record a reader is permitted to see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordView {
    /// Nothing may be returned
    Deny,
    /// Provenance metadata only
    MetadataOnly,
    /// Anonymized content
    Anonymized,
    /// Content as ingested
    Full,
}

impl RecordView {
    /// Map an effective consent level to its view
    pub fn from_level(level: ConsentLevel) -> Self {
        match level {
            ConsentLevel::None => RecordView::Deny,
            ConsentLevel::MetadataOnly => RecordView::MetadataOnly,
            ConsentLevel::Anonymized => RecordView::Anonymized,
            ConsentLevel::Full => RecordView::Full,
        }
    }

    /// Whether the view exposes any content
    pub fn exposes_content(self) -> bool {
        matches!(self, RecordView::Anonymized | RecordView::Full)
    }
}

/// Single-use confirmation required to raise a record's consent level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmationToken(pub Uuid);

#[derive(Debug, Clone)]
struct PendingConfirmation {
    record_id: RecordId,
    level: ConsentLevel,
    expires_at: DateTime<Utc>,
}

/// Consent gate over a set of source policies
pub struct ConsentGate {
    default_level: ConsentLevel,
    policies: HashMap<String, SourcePolicy>,
    confirmations: HashMap<ConfirmationToken, PendingConfirmation>,
}

impl ConsentGate {
    /// Create a gate whose unregistered sources default to `default_level`
    pub fn new(default_level: ConsentLevel) -> Self {
        Self {
            default_level,
            policies: HashMap::new(),
            confirmations: HashMap::new(),
        }
    }

    /// Register (or replace) a source policy
    pub fn register(&mut self, policy: SourcePolicy) {
        self.policies.insert(policy.source.clone(), policy);
    }

    /// Remove a source policy
    pub fn unregister(&mut self, source: &str) -> Option<SourcePolicy> {
        self.policies.remove(source)
    }

    /// Registered policies
    pub fn policies(&self) -> impl Iterator<Item = &SourcePolicy> {
        self.policies.values()
    }

    /// Resolve the policy for a source: exact match, then the namespace
    /// before the first `:`, then `None` for the gate default.
    pub fn policy_for(&self, source: &str) -> Option<&SourcePolicy> {
        self.policies.get(source).or_else(|| {
            source
                .split_once(':')
                .and_then(|(namespace, _)| self.policies.get(namespace))
        })
    }

    /// Highest level the source may be granted
    pub fn source_default(&self, source: &str) -> ConsentLevel {
        self.policy_for(source)
            .map(|p| p.default_level)
            .unwrap_or(self.default_level)
    }

    /// Evaluate a write: ratchet the requested level down to the source
    /// default. Pure; does not reject `None`, callers decide.
    pub fn evaluate(&self, source: &str, requested: ConsentLevel) -> ConsentDecision {
        let policy = self.policy_for(source);
        let source_default = policy.map(|p| p.default_level).unwrap_or(self.default_level);
        let allowed_level = requested.ratchet(source_default);

        ConsentDecision {
            allowed_level,
            retention_days: policy.and_then(|p| p.retention_days),
            downgraded: allowed_level < requested,
        }
    }

    /// Like [`evaluate`](Self::evaluate) but accepts the level as text,
    /// failing with [`Error::Config`] on unknown values.
    pub fn evaluate_str(&self, source: &str, requested: &str) -> Result<ConsentDecision> {
        Ok(self.evaluate(source, requested.parse()?))
    }

    /// View a reader may see of a record stored at `record_level`.
    /// Re-checks the current source policy so a lowered policy applies to
    /// records ingested earlier.
    pub fn read_view(&self, source: &str, record_level: ConsentLevel) -> RecordView {
        RecordView::from_level(record_level.ratchet(self.source_default(source)))
    }

    /// Issue a confirmation token permitting `record_id` to be raised to `level`
    pub fn issue_confirmation(&mut self, record_id: &RecordId, level: ConsentLevel) -> ConfirmationToken {
        let now = Utc::now();
        self.confirmations.retain(|_, p| p.expires_at > now);

        let token = ConfirmationToken(Uuid::new_v4());
        self.confirmations.insert(
            token,
            PendingConfirmation {
                record_id: record_id.clone(),
                level,
                expires_at: now + Duration::minutes(CONFIRMATION_TTL_MINUTES),
            },
        );
        token
    }

    /// Decide whether a record may move from `current` to `requested`.
    ///
    /// Lowering is always allowed (except directly to `None`, which requires
    /// a purge). Raising consumes a matching confirmation token and is still
    /// capped by the source default.
    pub fn authorize_change(
        &mut self,
        record_id: &RecordId,
        source: &str,
        current: ConsentLevel,
        requested: ConsentLevel,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<ConsentLevel> {
        if requested == ConsentLevel::None {
            return Err(Error::ConsentDenied(format!(
                "record {} cannot be lowered to none; purge it instead",
                record_id
            )));
        }
        if requested <= current {
            return Ok(requested);
        }

        let token = confirmation.ok_or_else(|| {
            Error::ConsentDenied(format!(
                "raising record {} from {} to {} requires confirmation",
                record_id, current, requested
            ))
        })?;
        let pending = self
            .confirmations
            .remove(&token)
            .ok_or_else(|| Error::ConsentDenied("unknown or already used confirmation".to_string()))?;
        if pending.expires_at <= Utc::now() {
            return Err(Error::ConsentDenied("confirmation expired".to_string()));
        }
        if &pending.record_id != record_id || pending.level != requested {
            return Err(Error::ConsentDenied(
                "confirmation does not match this record and level".to_string(),
            ));
        }

        let capped = requested.ratchet(self.source_default(source));
        if capped <= current {
            return Err(Error::ConsentDenied(format!(
                "source '{}' does not permit raising above {}",
                source, current
            )));
        }
        Ok(capped)
    }
}

impl Default for ConsentGate {
    fn default() -> Self {
        Self::new(ConsentLevel::Full)
    }
}
