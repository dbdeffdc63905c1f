//! Memoria configuration management

use crate::consent::{ConsentLevel, SourcePolicy};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main Memoria configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoriaConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Consent defaults and per-source policies
    #[serde(default)]
    pub consent: ConsentConfig,

    /// Encryption configuration
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Vector index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval fusion configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Embedding backend configuration
    #[serde(default)]
    pub embedder: EmbedderConfig,
}

impl MemoriaConfig {
    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.index.dimension == 0 {
            return Err(Error::Config("index.dimension must be greater than zero".to_string()));
        }
        if self.index.segments == 0 {
            return Err(Error::Config("index.segments must be greater than zero".to_string()));
        }
        if self.crypto.kdf_iterations == 0 {
            return Err(Error::Config(
                "crypto.kdf_iterations must be greater than zero".to_string(),
            ));
        }
        if self.chunking.max_chars == 0 {
            return Err(Error::Config("chunking.max_chars must be greater than zero".to_string()));
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            return Err(Error::Config(
                "chunking.overlap_chars must be smaller than chunking.max_chars".to_string(),
            ));
        }
        if self.retrieval.semantic_weight < 0.0 || self.retrieval.keyword_weight < 0.0 {
            return Err(Error::Config("retrieval weights must not be negative".to_string()));
        }
        if self.retrieval.candidate_multiplier == 0 {
            return Err(Error::Config(
                "retrieval.candidate_multiplier must be greater than zero".to_string(),
            ));
        }
        if self.storage.audit_memory_limit == 0 {
            return Err(Error::Config(
                "storage.audit_memory_limit must be greater than zero".to_string(),
            ));
        }
        if self.storage.max_record_bytes == 0 {
            return Err(Error::Config(
                "storage.max_record_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for vault state
    pub base_dir: PathBuf,

    /// Largest accepted record text, in bytes
    pub max_record_bytes: usize,

    /// Audit entries kept in memory; older ones live only in `audit.jsonl`
    #[serde(default = "default_audit_memory_limit")]
    pub audit_memory_limit: usize,
}

fn default_audit_memory_limit() -> usize {
    crate::audit::DEFAULT_MEMORY_LIMIT
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: dirs_next::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("memoria"),
            max_record_bytes: 8 * 1024 * 1024,
            audit_memory_limit: default_audit_memory_limit(),
        }
    }
}

/// Consent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentConfig {
    /// Level granted to sources without a registered policy
    pub default_level: ConsentLevel,

    /// Per-source policies
    #[serde(default)]
    pub sources: Vec<SourcePolicy>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            default_level: ConsentLevel::Full,
            sources: Vec::new(),
        }
    }
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Environment variable holding the master secret
    pub master_key_env: String,

    /// Days a retired data key is kept before it is destroyed
    pub rotation_retention_days: u32,

    /// PBKDF2 iterations for wrapping keys
    pub kdf_iterations: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key_env: "MEMORIA_MASTER_KEY".to_string(),
            rotation_retention_days: 90,
            kdf_iterations: 100_000,
        }
    }
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Embedding dimension
    pub dimension: usize,

    /// Number of independently locked segments
    pub segments: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            segments: 16,
        }
    }
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Largest chunk, in characters
    pub max_chars: usize,

    /// Overlap between fixed-size chunks, in characters
    pub overlap_chars: usize,

    /// Markers required before a structural split is used
    pub min_structural_markers: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            overlap_chars: 200,
            min_structural_markers: 2,
        }
    }
}

/// Retrieval fusion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Reciprocal-rank fusion constant
    pub rrf_k: f32,

    /// Weight of the semantic ranking
    pub semantic_weight: f32,

    /// Weight of the keyword ranking
    pub keyword_weight: f32,

    /// Candidates fetched per ranking, as a multiple of `k`
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            candidate_multiplier: 2,
        }
    }
}

/// Embedding backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderBackend {
    /// Deterministic local feature hashing
    Hashing,
    /// Ollama server
    Ollama,
}

/// Embedding backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Backend to use
    pub backend: EmbedderBackend,

    /// Server URL for remote backends
    pub url: String,

    /// Model name for remote backends
    pub model: String,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: EmbedderBackend::Hashing,
            url: "http://localhost:11434".to_string(),
            model: "all-minilm".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemoriaConfig::default();
        assert_eq!(config.index.dimension, 384);
        assert_eq!(config.consent.default_level, ConsentLevel::Full);
        assert_eq!(config.crypto.kdf_iterations, 100_000);
        assert_eq!(config.embedder.backend, EmbedderBackend::Hashing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = MemoriaConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: MemoriaConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.chunking.max_chars, config.chunking.max_chars);
        assert_eq!(back.storage.base_dir, config.storage.base_dir);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [consent]
            default_level = "anonymized"

            [[consent.sources]]
            source = "email"
            default_level = "metadata_only"
            retention_days = 30
        "#;
        let config: MemoriaConfig = toml::from_str(text).unwrap();
        assert_eq!(config.consent.default_level, ConsentLevel::Anonymized);
        assert_eq!(config.consent.sources.len(), 1);
        assert_eq!(config.consent.sources[0].retention_days, Some(30));
        assert_eq!(config.index.segments, 16);
    }

    #[test]
    fn test_unknown_consent_level_rejected() {
        let text = r#"
            [consent]
            default_level = "everything"
        "#;
        assert!(toml::from_str::<MemoriaConfig>(text).is_err());
    }

    #[test]
    fn test_load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memoria.toml");
        std::fs::write(&path, "[chunking]\nmax_chars = 10\noverlap_chars = 10\nmin_structural_markers = 2\n").unwrap();
        assert!(matches!(MemoriaConfig::load(&path), Err(Error::Config(_))));
    }
}
