//! Consent level lattice

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Privacy tier governing storage and retrieval of a record.
///
/// Ordered as a lattice: `None < MetadataOnly < Anonymized < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentLevel {
    /// Nothing may be stored
    None,
    /// Only provenance metadata may be read
    MetadataOnly,
    /// Content readable after PII anonymization
    Anonymized,
    /// Content readable as ingested
    Full,
}

impl ConsentLevel {
    /// All levels in ascending order
    pub const ALL: [ConsentLevel; 4] = [
        ConsentLevel::None,
        ConsentLevel::MetadataOnly,
        ConsentLevel::Anonymized,
        ConsentLevel::Full,
    ];

    /// Merge two levels, keeping the stricter one
    pub fn ratchet(self, other: ConsentLevel) -> ConsentLevel {
        self.min(other)
    }

    /// Whether content at this level may be embedded and retrieved
    pub fn is_indexable(self) -> bool {
        self >= ConsentLevel::Anonymized
    }

    /// Wire name of the level
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentLevel::None => "none",
            ConsentLevel::MetadataOnly => "metadata_only",
            ConsentLevel::Anonymized => "anonymized",
            ConsentLevel::Full => "full",
        }
    }
}

impl fmt::Display for ConsentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ConsentLevel::None),
            "metadata_only" | "metadata-only" => Ok(ConsentLevel::MetadataOnly),
            "anonymized" => Ok(ConsentLevel::Anonymized),
            "full" => Ok(ConsentLevel::Full),
            other => Err(Error::Config(format!("unknown consent level '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lattice_order() {
        assert!(ConsentLevel::None < ConsentLevel::MetadataOnly);
        assert!(ConsentLevel::MetadataOnly < ConsentLevel::Anonymized);
        assert!(ConsentLevel::Anonymized < ConsentLevel::Full);
    }

    #[test]
    fn test_ratchet_keeps_stricter() {
        assert_eq!(
            ConsentLevel::Full.ratchet(ConsentLevel::Anonymized),
            ConsentLevel::Anonymized
        );
        assert_eq!(
            ConsentLevel::MetadataOnly.ratchet(ConsentLevel::Full),
            ConsentLevel::MetadataOnly
        );
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!("FULL".parse::<ConsentLevel>().unwrap(), ConsentLevel::Full);
        assert_eq!(
            "metadata_only".parse::<ConsentLevel>().unwrap(),
            ConsentLevel::MetadataOnly
        );
        for level in ConsentLevel::ALL {
            assert_eq!(level.as_str().parse::<ConsentLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_parse_unknown_is_config_error() {
        let err = "public".parse::<ConsentLevel>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_indexable() {
        assert!(!ConsentLevel::MetadataOnly.is_indexable());
        assert!(ConsentLevel::Anonymized.is_indexable());
        assert!(ConsentLevel::Full.is_indexable());
    }
}
