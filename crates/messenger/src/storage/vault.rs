//! Password-derived encryption of stored blobs.
//!
//! The master password is stretched with PBKDF2-HMAC-SHA256 into an
//! AES-256-GCM key. Each blob is sealed under a fresh random nonce and
//! stored as `{iv, data}` with both fields as byte arrays.

use pbkdf2::pbkdf2_hmac;
use protocol::{AeadKey, ProtocolError, KEY_LENGTH};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Length of the random salt stored with the identity blob.
pub const SALT_LENGTH: usize = 16;

/// An encrypted blob as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
}

/// The identity blob additionally carries the key-derivation salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBlob {
    pub salt: Vec<u8>,
    #[serde(flatten)]
    pub blob: EncryptedBlob,
}

/// Generates a fresh random salt.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Symmetric key derived from the master password. Never persisted.
pub struct StorageKey {
    key: AeadKey,
}

impl StorageKey {
    /// Derives the storage key for `password` and `salt`.
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut bytes[..]);
        Self {
            key: AeadKey::from_bytes(*bytes),
        }
    }

    /// Encrypts `plaintext` under a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, ProtocolError> {
        let sealed = self.key.seal(plaintext)?;
        Ok(EncryptedBlob {
            iv: sealed.nonce.to_vec(),
            data: sealed.ciphertext,
        })
    }

    /// Decrypts and authenticates `blob`.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        self.key.open(&blob.iv, &blob.data).map(Zeroizing::new)
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey").field("key", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let salt = generate_salt();
        let key = StorageKey::derive("correct horse", &salt);
        let blob = key.encrypt(b"{\"hello\":1}").unwrap();

        let again = StorageKey::derive("correct horse", &salt);
        assert_eq!(again.decrypt(&blob).unwrap().as_slice(), b"{\"hello\":1}");
    }

    #[test]
    fn test_wrong_password_fails() {
        let salt = generate_salt();
        let blob = StorageKey::derive("right", &salt).encrypt(b"secret").unwrap();
        assert!(matches!(
            StorageKey::derive("wrong", &salt).decrypt(&blob),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn test_salt_changes_key() {
        let blob = StorageKey::derive("pw", &[1u8; SALT_LENGTH])
            .encrypt(b"secret")
            .unwrap();
        assert!(StorageKey::derive("pw", &[2u8; SALT_LENGTH])
            .decrypt(&blob)
            .is_err());
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let key = StorageKey::derive("pw", &generate_salt());
        let blob = key.encrypt(b"tamper target").unwrap();

        for byte in 0..blob.data.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered.data[byte] ^= 1 << bit;
                assert!(key.decrypt(&tampered).is_err(), "byte {} bit {}", byte, bit);
            }
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = StorageKey::derive("pw", &generate_salt());
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_identity_blob_json_shape() {
        let blob = IdentityBlob {
            salt: vec![1, 2],
            blob: EncryptedBlob {
                iv: vec![3],
                data: vec![4, 5],
            },
        };
        let value = serde_json::to_value(&blob).unwrap();
        assert_eq!(value, serde_json::json!({"salt": [1, 2], "iv": [3], "data": [4, 5]}));
    }
}
