//! Record storage
//!
//! [`ContentStore`] holds encrypted records keyed by content hash;
//! [`RecordValidator`] admits records before anything is stored.

pub mod content;
pub mod record;
pub mod validate;

pub use content::{ContentStore, PutResult};
pub use record::{normalize_text, IngestRequest, Provenance, Record, RecordBuilder, RecordId};
pub use validate::RecordValidator;
