//! Memoria - Consent-Governed Personal Record Vault
//!
//! Memoria ingests personal records (journals, mail, scripture, notes),
//! encrypts them at rest under per-field keys, and serves them back to a
//! generation layer through hybrid semantic + keyword retrieval. Every
//! read and write passes a consent gate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Vault                               │
//! │   create · meditate · purge · status · export · import · retain  │
//! └───────┬──────────────────────┬───────────────────────┬──────────┘
//!         │ ingest               │ retrieve              │ archive
//! ┌───────▼────────┐    ┌────────▼─────────┐    ┌────────▼─────────┐
//! │ RecordValidator│    │ HybridRetriever  │    │ manifest, keys,  │
//! │ ConsentGate    │    │  semantic ─┐     │    │ records, index   │
//! │ Chunker        │    │  keyword  ─┴ RRF │    └──────────────────┘
//! │ Embedder       │    └────────┬─────────┘
//! └───────┬────────┘             │ consent re-check, decrypt
//! ┌───────▼──────────────────────▼──────────────────────────────────┐
//! │  ContentStore (encrypted records)   VectorIndex (span vectors)   │
//! │                  EncryptionService (rotating keyring)            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bundle`]: Bundle lifecycle and the [`Vault`] orchestrator
//! - [`consent`]: Consent levels, source policies and anonymization
//! - [`crypto`]: Envelope encryption and key rotation
//! - [`store`]: Record schema, validation and the content store
//! - [`chunk`]: Structural and fixed-size chunking
//! - [`index`]: Embedders, keyword tags and the vector index
//! - [`retrieval`]: Hybrid retrieval with reciprocal-rank fusion
//! - [`audit`]: Append-only audit log
//! - [`config`]: Configuration management

pub mod audit;
pub mod bundle;
pub mod chunk;
pub mod config;
pub mod consent;
pub mod context;
pub mod corpus;
pub mod crypto;
pub mod error;
pub mod index;
pub mod persist;
pub mod retrieval;
pub mod store;

pub use bundle::Vault;
pub use config::MemoriaConfig;
pub use context::Context;
pub use error::{Error, Result};
