//! Cryptographic utilities for records at rest
//!
//! Provides AES-256-GCM authenticated encryption, a versioned [`KeyRing`]
//! with per-field key derivation, and the [`EncryptionService`] that seals
//! record content into [`Envelope`]s.

mod envelope;
mod keys;
mod service;

pub use envelope::{Envelope, ALGORITHM};
pub use keys::{derive_wrapping_key, KeyInfo, KeyMaterial, KeyRing, SealedKeyRing, WrappedKey};
pub use service::EncryptionService;
pub(crate) use service::open_with;

use crate::error::{EncryptionError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

/// AES-256-GCM encryption key size
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM
pub const NONCE_SIZE: usize = 12;

/// Encrypt data using AES-256-GCM, binding `aad` into the tag.
///
/// Returns `(nonce, ciphertext)`; the ciphertext carries the 16-byte tag.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EncryptionError::Cipher(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| EncryptionError::Cipher(format!("Encryption failed: {}", e)))?;

    Ok((nonce_bytes.to_vec(), ciphertext))
}

/// Decrypt data using AES-256-GCM.
///
/// A tag mismatch (tampered ciphertext, wrong key or wrong `aad`) is
/// reported as [`EncryptionError::AuthenticationFailure`].
pub fn decrypt(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(EncryptionError::Cipher("Invalid nonce length".to_string()).into());
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| EncryptionError::Cipher(format!("Failed to create cipher: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| EncryptionError::AuthenticationFailure.into())
}

/// Generate a random encryption key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Serde adapter encoding byte fields as standard base64 strings
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: impl AsRef<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
