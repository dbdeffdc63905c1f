//! Consent governance
//!
//! Every write and every read passes through the [`ConsentGate`], which
//! resolves the strictest applicable [`ConsentLevel`] for a record and the
//! [`RecordView`] a reader may see. The [`Anonymizer`] produces the content
//! of the ANONYMIZED view.

mod anonymize;
mod gate;
mod level;

pub use anonymize::{default_anonymization_rules, AnonymizationRule, Anonymizer};
pub use gate::{ConfirmationToken, ConsentDecision, ConsentGate, RecordView, SourcePolicy};
pub use level::ConsentLevel;
