//! Record schema validation
//!
//! Runs before consent evaluation or encryption; a rejected request leaves
//! no trace in any store.

use super::record::{IngestRequest, Record, RecordId};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Maximum source identifier length
const MAX_SOURCE_LEN: usize = 256;

/// Allowed clock skew between event time and ingestion time
const MAX_CLOCK_SKEW_MINUTES: i64 = 5;

/// Enforces the canonical record schema
#[derive(Debug, Clone)]
pub struct RecordValidator {
    max_text_bytes: usize,
    max_skew: Duration,
}

impl RecordValidator {
    /// Create a validator limiting text to `max_text_bytes`
    pub fn new(max_text_bytes: usize) -> Self {
        Self {
            max_text_bytes,
            max_skew: Duration::minutes(MAX_CLOCK_SKEW_MINUTES),
        }
    }

    fn earliest() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1000, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Validate an ingestion request already normalized to `normalized_text`
    pub fn validate_request(
        &self,
        owner_id: &str,
        request: &IngestRequest,
        normalized_text: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if owner_id.trim().is_empty() {
            return Err(Error::Validation("owner_id must not be empty".to_string()));
        }
        self.validate_source(&request.source)?;

        if normalized_text.is_empty() {
            return Err(Error::Validation("text must not be empty".to_string()));
        }
        if normalized_text.len() > self.max_text_bytes {
            return Err(Error::Validation(format!(
                "text is {} bytes, limit is {}",
                normalized_text.len(),
                self.max_text_bytes
            )));
        }

        self.validate_timestamp(request.timestamp, now)?;

        if request.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(Error::Validation("metadata keys must not be empty".to_string()));
        }
        Ok(())
    }

    fn validate_source(&self, source: &str) -> Result<()> {
        if source.trim().is_empty() {
            return Err(Error::Validation("source must not be empty".to_string()));
        }
        if source.len() > MAX_SOURCE_LEN {
            return Err(Error::Validation(format!(
                "source exceeds {} characters",
                MAX_SOURCE_LEN
            )));
        }
        if source.chars().any(char::is_control) {
            return Err(Error::Validation(
                "source must not contain control characters".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_timestamp(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if timestamp > now + self.max_skew {
            return Err(Error::Validation(format!(
                "event timestamp {} is after ingestion time {}",
                timestamp, now
            )));
        }
        if timestamp < Self::earliest() {
            return Err(Error::Validation(format!(
                "event timestamp {} is out of range",
                timestamp
            )));
        }
        Ok(())
    }

    /// Validate a stored record, e.g. one read from an archive
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        RecordId::parse(record.id.as_str())?;
        if record.owner_id.trim().is_empty() {
            return Err(Error::Validation("owner_id must not be empty".to_string()));
        }
        self.validate_source(&record.source)?;
        if record.provenance.is_empty() {
            return Err(Error::Validation(format!(
                "record {} has no provenance",
                record.id
            )));
        }
        let ordered = record
            .provenance
            .windows(2)
            .all(|w| w[0].ingested_at <= w[1].ingested_at);
        if !ordered {
            return Err(Error::Validation(format!(
                "record {} provenance is not in ingestion order",
                record.id
            )));
        }
        self.validate_timestamp(record.timestamp, record.first_ingested_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::tests::test_record;
    use crate::store::record::Provenance;

    fn validator() -> RecordValidator {
        RecordValidator::new(1024)
    }

    fn request(text: &str) -> IngestRequest {
        IngestRequest::new("journal", Utc::now(), text)
    }

    #[test]
    fn test_valid_request() {
        let req = request("Dear diary");
        assert!(validator()
            .validate_request("alice", &req, "Dear diary", Utc::now())
            .is_ok());
    }

    #[test]
    fn test_empty_text_rejected() {
        let req = request("   ");
        assert!(matches!(
            validator().validate_request("alice", &req, "", Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_empty_owner_rejected() {
        let req = request("x");
        assert!(validator().validate_request(" ", &req, "x", Utc::now()).is_err());
    }

    #[test]
    fn test_oversized_rejected() {
        let text = "a".repeat(2048);
        let req = request(&text);
        assert!(validator()
            .validate_request("alice", &req, &text, Utc::now())
            .is_err());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let now = Utc::now();
        let req = IngestRequest::new("journal", now + Duration::hours(1), "x");
        assert!(validator().validate_request("alice", &req, "x", now).is_err());

        let within_skew = IngestRequest::new("journal", now + Duration::minutes(1), "x");
        assert!(validator().validate_request("alice", &within_skew, "x", now).is_ok());
    }

    #[test]
    fn test_bad_source_rejected() {
        let now = Utc::now();
        let req = IngestRequest::new("jour\nnal", now, "x");
        assert!(validator().validate_request("alice", &req, "x", now).is_err());
        let req = IngestRequest::new("", now, "x");
        assert!(validator().validate_request("alice", &req, "x", now).is_err());
    }

    #[test]
    fn test_empty_metadata_key_rejected() {
        let req = request("x").metadata(" ", serde_json::json!(1));
        assert!(validator().validate_request("alice", &req, "x", Utc::now()).is_err());
    }

    #[test]
    fn test_validate_record_provenance_order() {
        let mut record = test_record("alice", "journal", "hello");
        assert!(validator().validate_record(&record).is_ok());

        let mut earlier = Provenance::now(Utc::now(), None);
        earlier.ingested_at = record.provenance[0].ingested_at - Duration::days(1);
        record.provenance.push(earlier);
        assert!(validator().validate_record(&record).is_err());
    }
}
