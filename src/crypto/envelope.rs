//! Encryption envelope stored alongside each record

use serde::{Deserialize, Serialize};

/// Algorithm identifier written into every envelope
pub const ALGORITHM: &str = "AES-256-GCM";

/// Authenticated ciphertext plus what is needed to open it again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Algorithm identifier
    pub algorithm: String,
    /// Data key the field key was derived from
    pub key_id: String,
    /// Field the key was derived for
    pub field: String,
    /// AES-GCM nonce
    #[serde(with = "super::b64")]
    pub nonce: Vec<u8>,
    /// Ciphertext including the authentication tag
    #[serde(with = "super::b64")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Additional authenticated data binding the envelope to its owner,
    /// field and key
    pub(crate) fn aad(owner_id: &str, field: &str, key_id: &str) -> Vec<u8> {
        format!("{}\0{}\0{}", owner_id, field, key_id).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_serialize_as_base64() {
        let envelope = Envelope {
            algorithm: ALGORITHM.to_string(),
            key_id: "k1".to_string(),
            field: "content".to_string(),
            nonce: vec![0u8; 12],
            ciphertext: b"abc".to_vec(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["nonce"], "AAAAAAAAAAAAAAAA");
        assert_eq!(json["ciphertext"], "YWJj");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
