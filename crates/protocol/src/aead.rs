//! AES-256-GCM authenticated encryption.
//!
//! Both the per-peer shared secret and the at-rest storage key are
//! [`AeadKey`]s. Every call to [`AeadKey::seal`] draws a fresh 96-bit nonce
//! from the operating system RNG, so callers never manage nonces themselves.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Length of an AES-256 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of an AES-GCM nonce in bytes (96 bits).
pub const NONCE_LENGTH: usize = 12;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LENGTH: usize = 16;

/// Output of a single encryption: the nonce used and the ciphertext with tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Random nonce used for this encryption.
    pub nonce: [u8; NONCE_LENGTH],
    /// Ciphertext followed by the authentication tag.
    pub ciphertext: Vec<u8>,
}

/// A symmetric AEAD key.
///
/// The raw key bytes are zeroized when the key is dropped.
pub struct AeadKey {
    bytes: Zeroizing<[u8; KEY_LENGTH]>,
}

impl AeadKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes[..])
            .map_err(|e| ProtocolError::Encryption(format!("invalid key length: {}", e)))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::Encryption("AES-GCM encryption failed".to_string()))?;

        Ok(Sealed { nonce, ciphertext })
    }

    /// Decrypts and authenticates `ciphertext`.
    ///
    /// Any tampering with the nonce or ciphertext yields
    /// [`ProtocolError::Decryption`]; corrupted plaintext is never returned.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "invalid nonce length: expected {}, got {}",
                NONCE_LENGTH,
                nonce.len()
            )));
        }
        if ciphertext.len() < TAG_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKey").field("key", &"[REDACTED]").finish()
    }
}
