//! Bundles: named, portable aggregates of records
//!
//! A bundle groups records meditated from one body of text (a scripture,
//! a diary, a mail archive) under a single consent policy, and is the unit
//! of purge, export and import. [`Vault`] implements the lifecycle.

pub mod archive;
mod types;
mod vault;

pub use archive::{Archive, Manifest, SCHEMA_VERSION};
pub use types::{
    source_for, validate_name, Bundle, BundlePolicy, BundleStatus, IngestReport, MeditateInput,
    MeditateReport, PurgeReport, RecordReadout, RetentionReport, BUNDLE_NAMESPACE,
};
pub use vault::Vault;
