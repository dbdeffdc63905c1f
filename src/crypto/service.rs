//! Envelope encryption over a shared keyring

use super::envelope::{Envelope, ALGORITHM};
use super::keys::{KeyMaterial, KeyRing, SealedKeyRing, WrappedKey};
use super::{decrypt, encrypt};
use crate::error::{EncryptionError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Seals and opens record fields with per-field derived keys
#[derive(Clone)]
pub struct EncryptionService {
    keyring: Arc<RwLock<KeyRing>>,
}

impl EncryptionService {
    /// Create a service over the given keyring
    pub fn new(keyring: KeyRing) -> Self {
        Self {
            keyring: Arc::new(RwLock::new(keyring)),
        }
    }

    /// Encrypt `plaintext` for `(owner_id, field)` under the active key
    pub async fn encrypt(&self, plaintext: &[u8], owner_id: &str, field: &str) -> Result<Envelope> {
        let ring = self.keyring.read().await;
        seal_with(&ring, plaintext, owner_id, field)
    }

    /// Decrypt an envelope.
    ///
    /// Fails with `KeyNotFound` once the envelope's key has been pruned or
    /// erased, and with `AuthenticationFailure` on tampering.
    pub async fn decrypt(&self, envelope: &Envelope, owner_id: &str) -> Result<Vec<u8>> {
        let ring = self.keyring.read().await;
        open_with(&ring, envelope, owner_id)
    }

    /// Decrypt an envelope holding UTF-8 text
    pub async fn decrypt_text(&self, envelope: &Envelope, owner_id: &str) -> Result<String> {
        let bytes = self.decrypt(envelope, owner_id).await?;
        String::from_utf8(bytes)
            .map_err(|_| EncryptionError::Cipher("plaintext is not valid UTF-8".to_string()).into())
    }

    /// Id of the active key
    pub async fn active_key_id(&self) -> String {
        self.keyring.read().await.active_key_id().to_string()
    }

    /// Rotate to a fresh active key
    pub async fn rotate(&self) -> String {
        let key_id = self.keyring.write().await.rotate();
        tracing::info!(key_id = %key_id, "Rotated active data key");
        key_id
    }

    /// Destroy retired keys past the retention window
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let pruned = self.keyring.write().await.prune_expired(now);
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "Crypto-erased expired data keys");
        }
        pruned
    }

    /// Crypto-erase a retired key immediately
    pub async fn erase(&self, key_id: &str) -> Result<bool> {
        self.keyring.write().await.erase(key_id)
    }

    /// Whether the keyring still holds `key_id`
    pub async fn has_key(&self, key_id: &str) -> bool {
        self.keyring.read().await.contains(key_id)
    }

    /// Key for hashing keyword tokens
    pub async fn index_key(&self) -> Result<KeyMaterial> {
        self.keyring.read().await.index_key()
    }

    /// Wrap data keys for an archive
    pub async fn export_keys(&self, key_ids: &[String], wrapping: &KeyMaterial) -> Result<Vec<WrappedKey>> {
        self.keyring
            .read()
            .await
            .export_keys(key_ids.iter().map(String::as_str), wrapping)
    }

    /// Seal the keyring for persistence
    pub async fn seal(&self, passphrase: &str, iterations: u32) -> Result<SealedKeyRing> {
        self.keyring.read().await.seal(passphrase, iterations)
    }
}

/// Seal a field under a specific keyring's active key
pub(crate) fn seal_with(ring: &KeyRing, plaintext: &[u8], owner_id: &str, field: &str) -> Result<Envelope> {
    let key_id = ring.active_key_id().to_string();
    let key = ring.derive_field_key(&key_id, owner_id, field)?;
    let aad = Envelope::aad(owner_id, field, &key_id);
    let (nonce, ciphertext) = encrypt(key.as_bytes(), plaintext, &aad)?;

    Ok(Envelope {
        algorithm: ALGORITHM.to_string(),
        key_id,
        field: field.to_string(),
        nonce,
        ciphertext,
    })
}

/// Open an envelope with a specific keyring
pub(crate) fn open_with(ring: &KeyRing, envelope: &Envelope, owner_id: &str) -> Result<Vec<u8>> {
    if envelope.algorithm != ALGORITHM {
        return Err(EncryptionError::Cipher(format!(
            "unsupported algorithm '{}'",
            envelope.algorithm
        ))
        .into());
    }
    let key = ring.derive_field_key(&envelope.key_id, owner_id, &envelope.field)?;
    let aad = Envelope::aad(owner_id, &envelope.field, &envelope.key_id);
    decrypt(key.as_bytes(), &envelope.nonce, &envelope.ciphertext, &aad)
}
