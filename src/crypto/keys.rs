//! Versioned key management with crypto-erase
//!
//! The keyring holds data keys identified by a UUID. Field keys are never
//! stored: they are derived on demand with HKDF-SHA256 from a data key,
//! salted with the owner id and labelled with the field name. Rotation adds a
//! new active key and retires the previous one; retired keys are kept for the
//! retention window and destroyed afterwards, at which point every envelope
//! sealed under them becomes permanently unreadable.

use super::{b64, decrypt, encrypt, generate_key, KEY_SIZE};
use crate::error::{EncryptionError, Error, Result};
use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const INDEX_KEY_INFO: &[u8] = b"memoria:index:v1";
const WRAP_AAD: &[u8] = b"memoria:keywrap:v1";

/// Raw key bytes, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    /// Fresh random key
    pub fn generate() -> Self {
        Self(generate_key())
    }

    /// Access the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| EncryptionError::Cipher("Invalid key length".to_string()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Public description of a data key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Key identifier
    pub key_id: String,
    /// When the key was created
    pub created_at: DateTime<Utc>,
    /// When the key stopped being the active key
    pub retired_at: Option<DateTime<Utc>>,
}

struct DataKey {
    info: KeyInfo,
    material: KeyMaterial,
}

/// A data key sealed under a wrapping key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Key metadata
    #[serde(flatten)]
    pub info: KeyInfo,
    /// Nonce used to wrap the key
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Wrapped key bytes
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Serialized keyring: every secret is wrapped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKeyRing {
    /// Salt used to derive the wrapping key
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// Active key id
    pub active: String,
    /// Retention window for retired keys, in days
    pub retention_days: u32,
    /// Data keys
    pub keys: Vec<WrappedKey>,
    /// Keyword index secret
    pub index_secret: WrappedKey,
}

/// Derive a wrapping key from a passphrase with PBKDF2-HMAC-SHA256
pub fn derive_wrapping_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<KeyMaterial> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| Error::Config("kdf_iterations must be greater than zero".to_string()))?;
    let mut out = [0u8; KEY_SIZE];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut out,
    );
    let key = KeyMaterial(out);
    out.zeroize();
    Ok(key)
}

fn wrap(wrapping: &KeyMaterial, info: KeyInfo, material: &KeyMaterial) -> Result<WrappedKey> {
    let (nonce, ciphertext) = encrypt(wrapping.as_bytes(), material.as_bytes(), WRAP_AAD)?;
    Ok(WrappedKey {
        info,
        nonce,
        ciphertext,
    })
}

fn unwrap_key(wrapping: &KeyMaterial, wrapped: &WrappedKey) -> Result<KeyMaterial> {
    let mut bytes = decrypt(wrapping.as_bytes(), &wrapped.nonce, &wrapped.ciphertext, WRAP_AAD)?;
    let key = KeyMaterial::from_slice(&bytes);
    bytes.zeroize();
    key
}

/// Versioned set of data keys
pub struct KeyRing {
    keys: HashMap<String, DataKey>,
    active: String,
    index_secret: KeyMaterial,
    retention: Duration,
}

impl KeyRing {
    /// Create a keyring with one fresh active key
    pub fn generate(retention_days: u32) -> Self {
        let mut ring = Self {
            keys: HashMap::new(),
            active: String::new(),
            index_secret: KeyMaterial::generate(),
            retention: Duration::days(i64::from(retention_days)),
        };
        ring.active = ring.insert_new_key();
        ring
    }

    fn insert_new_key(&mut self) -> String {
        let key_id = Uuid::new_v4().to_string();
        self.keys.insert(
            key_id.clone(),
            DataKey {
                info: KeyInfo {
                    key_id: key_id.clone(),
                    created_at: Utc::now(),
                    retired_at: None,
                },
                material: KeyMaterial::generate(),
            },
        );
        key_id
    }

    /// Id of the key new envelopes are sealed under
    pub fn active_key_id(&self) -> &str {
        &self.active
    }

    /// Whether the keyring still holds `key_id`
    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Metadata for every held key
    pub fn keys(&self) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = self.keys.values().map(|k| k.info.clone()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Retire the active key and create a new one. Existing envelopes are
    /// untouched and remain readable until the retired key is pruned.
    pub fn rotate(&mut self) -> String {
        if let Some(current) = self.keys.get_mut(&self.active) {
            current.info.retired_at = Some(Utc::now());
        }
        self.active = self.insert_new_key();
        self.active.clone()
    }

    /// Destroy retired keys whose retention window has passed
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let retention = self.retention;
        let expired: Vec<String> = self
            .keys
            .values()
            .filter(|k| {
                k.info
                    .retired_at
                    .map(|retired| retired + retention <= now)
                    .unwrap_or(false)
            })
            .map(|k| k.info.key_id.clone())
            .collect();

        for key_id in &expired {
            self.keys.remove(key_id);
        }
        expired
    }

    /// Crypto-erase a key immediately. The active key cannot be erased;
    /// rotate first.
    pub fn erase(&mut self, key_id: &str) -> Result<bool> {
        if key_id == self.active {
            return Err(Error::Validation(
                "cannot erase the active key; rotate first".to_string(),
            ));
        }
        Ok(self.keys.remove(key_id).is_some())
    }

    /// Derive the key for `(owner_id, field)` under data key `key_id`
    pub fn derive_field_key(&self, key_id: &str, owner_id: &str, field: &str) -> Result<KeyMaterial> {
        let data_key = self.keys.get(key_id).ok_or_else(|| EncryptionError::KeyNotFound {
            key_id: key_id.to_string(),
        })?;
        let info = format!("memoria:field:{}", field);
        expand(data_key.material.as_bytes(), owner_id.as_bytes(), info.as_bytes())
    }

    /// Key used to hash keyword tokens in the search index
    pub fn index_key(&self) -> Result<KeyMaterial> {
        expand(self.index_secret.as_bytes(), &[], INDEX_KEY_INFO)
    }

    /// Wrap the given data keys for transport
    pub fn export_keys<'a>(
        &self,
        key_ids: impl IntoIterator<Item = &'a str>,
        wrapping: &KeyMaterial,
    ) -> Result<Vec<WrappedKey>> {
        key_ids
            .into_iter()
            .map(|key_id| {
                let key = self.keys.get(key_id).ok_or_else(|| EncryptionError::KeyNotFound {
                    key_id: key_id.to_string(),
                })?;
                wrap(wrapping, key.info.clone(), &key.material)
            })
            .collect()
    }

    /// Unwrap transported keys into a detached, read-only keyring used to
    /// open envelopes from an archive
    pub fn from_wrapped(keys: &[WrappedKey], wrapping: &KeyMaterial) -> Result<Self> {
        let mut map = HashMap::new();
        for wrapped in keys {
            let material = unwrap_key(wrapping, wrapped)?;
            map.insert(
                wrapped.info.key_id.clone(),
                DataKey {
                    info: wrapped.info.clone(),
                    material,
                },
            );
        }
        Ok(Self {
            keys: map,
            active: String::new(),
            index_secret: KeyMaterial::generate(),
            retention: Duration::zero(),
        })
    }

    /// Seal the whole keyring under a passphrase
    pub fn seal(&self, passphrase: &str, iterations: u32) -> Result<SealedKeyRing> {
        let salt = generate_key().to_vec();
        let wrapping = derive_wrapping_key(passphrase, &salt, iterations)?;
        let keys = self
            .keys
            .values()
            .map(|k| wrap(&wrapping, k.info.clone(), &k.material))
            .collect::<Result<Vec<_>>>()?;
        let index_info = KeyInfo {
            key_id: "index".to_string(),
            created_at: Utc::now(),
            retired_at: None,
        };

        Ok(SealedKeyRing {
            salt,
            active: self.active.clone(),
            retention_days: self.retention.num_days().max(0) as u32,
            keys,
            index_secret: wrap(&wrapping, index_info, &self.index_secret)?,
        })
    }

    /// Open a sealed keyring. A wrong passphrase fails with an
    /// authentication failure.
    pub fn unseal(sealed: &SealedKeyRing, passphrase: &str, iterations: u32) -> Result<Self> {
        let wrapping = derive_wrapping_key(passphrase, &sealed.salt, iterations)?;
        let mut ring = Self::from_wrapped(&sealed.keys, &wrapping)?;
        if !ring.keys.contains_key(&sealed.active) {
            return Err(EncryptionError::KeyNotFound {
                key_id: sealed.active.clone(),
            }
            .into());
        }
        ring.active = sealed.active.clone();
        ring.index_secret = unwrap_key(&wrapping, &sealed.index_secret)?;
        ring.retention = Duration::days(i64::from(sealed.retention_days));
        Ok(ring)
    }
}

fn expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<KeyMaterial> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|e| EncryptionError::Cipher(format!("hkdf expand failed: {:?}", e)))?;
    let key = KeyMaterial(okm);
    okm.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_keys_differ_by_owner_and_field() {
        let ring = KeyRing::generate(90);
        let id = ring.active_key_id().to_string();
        let a = ring.derive_field_key(&id, "alice", "content").unwrap();
        let b = ring.derive_field_key(&id, "bob", "content").unwrap();
        let c = ring.derive_field_key(&id, "alice", "title").unwrap();
        let a2 = ring.derive_field_key(&id, "alice", "content").unwrap();

        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert_eq!(a.as_bytes(), a2.as_bytes());
    }

    #[test]
    fn test_rotate_keeps_old_key() {
        let mut ring = KeyRing::generate(90);
        let old = ring.active_key_id().to_string();
        let new = ring.rotate();

        assert_ne!(old, new);
        assert_eq!(ring.active_key_id(), new);
        assert!(ring.contains(&old));
        assert!(ring.keys().iter().any(|k| k.key_id == old && k.retired_at.is_some()));
    }

    #[test]
    fn test_prune_after_retention() {
        let mut ring = KeyRing::generate(30);
        let old = ring.active_key_id().to_string();
        ring.rotate();

        assert!(ring.prune_expired(Utc::now()).is_empty());
        let pruned = ring.prune_expired(Utc::now() + Duration::days(31));
        assert_eq!(pruned, vec![old.clone()]);
        assert!(matches!(
            ring.derive_field_key(&old, "alice", "content"),
            Err(Error::Encryption(EncryptionError::KeyNotFound { .. }))
        ));
    }

    #[test]
    fn test_cannot_erase_active() {
        let mut ring = KeyRing::generate(30);
        let active = ring.active_key_id().to_string();
        assert!(ring.erase(&active).is_err());
        let old = active;
        ring.rotate();
        assert!(ring.erase(&old).unwrap());
        assert!(!ring.contains(&old));
    }

    #[test]
    fn test_seal_unseal() {
        let mut ring = KeyRing::generate(30);
        ring.rotate();
        let active = ring.active_key_id().to_string();
        let before = ring.derive_field_key(&active, "alice", "content").unwrap();
        let index_before = ring.index_key().unwrap();

        let sealed = ring.seal("correct horse", 1_000).unwrap();
        let json = serde_json::to_string(&sealed).unwrap();
        let sealed: SealedKeyRing = serde_json::from_str(&json).unwrap();
        let opened = KeyRing::unseal(&sealed, "correct horse", 1_000).unwrap();

        assert_eq!(opened.active_key_id(), active);
        assert_eq!(opened.keys().len(), 2);
        let after = opened.derive_field_key(&active, "alice", "content").unwrap();
        assert_eq!(before.as_bytes(), after.as_bytes());
        assert_eq!(index_before.as_bytes(), opened.index_key().unwrap().as_bytes());
    }

    #[test]
    fn test_unseal_wrong_passphrase() {
        let ring = KeyRing::generate(30);
        let sealed = ring.seal("right", 1_000).unwrap();
        assert!(matches!(
            KeyRing::unseal(&sealed, "wrong", 1_000),
            Err(Error::Encryption(EncryptionError::AuthenticationFailure))
        ));
    }

    #[test]
    fn test_export_and_detached_ring() {
        let ring = KeyRing::generate(30);
        let id = ring.active_key_id().to_string();
        let wrapping = derive_wrapping_key("pass", b"salt", 1_000).unwrap();
        let wrapped = ring.export_keys([id.as_str()], &wrapping).unwrap();

        let detached = KeyRing::from_wrapped(&wrapped, &wrapping).unwrap();
        assert_eq!(
            ring.derive_field_key(&id, "o", "f").unwrap().as_bytes(),
            detached.derive_field_key(&id, "o", "f").unwrap().as_bytes()
        );
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(matches!(
            derive_wrapping_key("p", b"s", 0),
            Err(Error::Config(_))
        ));
    }
}
