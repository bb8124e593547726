//! Cryptographic identity and numeric addressing.
//!
//! Every user is an X25519 keypair. The public numeric identifier, which also
//! serves as the transport-level address, is derived from the public key:
//! SHA-256 of the raw 32-byte key, the first four bytes read as a big-endian
//! `u32`, reduced modulo 10^9 and zero-padded to nine digits.
//!
//! The 32-bit fold means two distinct keys can map to the same id. Nothing
//! here detects or resolves such collisions.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};

/// Number of decimal digits in a numeric identifier.
pub const NUMERIC_ID_DIGITS: usize = 9;

const NUMERIC_ID_MODULUS: u32 = 1_000_000_000;

/// Length of a raw X25519 key in bytes.
pub const KEY_LENGTH: usize = 32;

const JWK_KEY_TYPE: &str = "OKP";
const JWK_CURVE: &str = "X25519";

/// A nine-digit public identifier bound to a public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NumericId(String);

impl NumericId {
    /// Parses a strictly formatted identifier: exactly nine ASCII digits.
    pub fn new(value: &str) -> Result<Self> {
        if value.len() == NUMERIC_ID_DIGITS && value.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(value.to_string()))
        } else {
            Err(ProtocolError::InvalidNumericId(value.to_string()))
        }
    }

    /// Parses user input such as `#123 456 789` or `123-456-789`.
    ///
    /// All non-digit characters are dropped before validation.
    pub fn parse(input: &str) -> Result<Self> {
        let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
        Self::new(&digits).map_err(|_| ProtocolError::InvalidNumericId(input.to_string()))
    }

    /// Derives the identifier for a public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = Sha256::digest(public_key.as_bytes());
        let prefix = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        Self(format!(
            "{:0width$}",
            prefix % NUMERIC_ID_MODULUS,
            width = NUMERIC_ID_DIGITS
        ))
    }

    /// Returns the bare nine digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Formats the identifier for display as `#DDD DDD DDD`.
    pub fn display_form(&self) -> String {
        format!("#{} {} {}", &self.0[0..3], &self.0[3..6], &self.0[6..9])
    }
}

impl std::fmt::Display for NumericId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NumericId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<NumericId> for String {
    fn from(id: NumericId) -> Self {
        id.0
    }
}

impl std::str::FromStr for NumericId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// JSON Web Key representation of an X25519 key.
///
/// `d` is present only for private keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `OKP`.
    pub kty: String,
    /// Curve name, always `X25519`.
    pub crv: String,
    /// Base64url-encoded public key.
    pub x: String,
    /// Base64url-encoded private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    fn from_public(public_key: &PublicKey) -> Self {
        Self {
            kty: JWK_KEY_TYPE.to_string(),
            crv: JWK_CURVE.to_string(),
            x: URL_SAFE_NO_PAD.encode(public_key.as_bytes()),
            d: None,
        }
    }

    fn from_secret(secret: &StaticSecret, public_key: &PublicKey) -> Self {
        Self {
            d: Some(URL_SAFE_NO_PAD.encode(secret.as_bytes())),
            ..Self::from_public(public_key)
        }
    }

    fn check_curve(&self) -> Result<()> {
        if self.kty != JWK_KEY_TYPE || self.crv != JWK_CURVE {
            return Err(ProtocolError::InvalidKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        Ok(())
    }

    /// Decodes the public part of this key.
    pub fn to_public_key(&self) -> Result<PublicKey> {
        self.check_curve()?;
        let bytes = decode_key_bytes(&self.x)?;
        Ok(PublicKey::from(bytes))
    }

    fn to_secret(&self) -> Result<StaticSecret> {
        self.check_curve()?;
        let encoded = self
            .d
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidKey("missing private component".to_string()))?;
        let bytes = decode_key_bytes(encoded)?;
        Ok(StaticSecret::from(bytes))
    }
}

fn decode_key_bytes(encoded: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| ProtocolError::InvalidKey(format!("invalid base64url: {}", e)))?;
    <[u8; KEY_LENGTH]>::try_from(bytes.as_slice()).map_err(|_| {
        ProtocolError::InvalidKey(format!(
            "invalid key length: expected {}, got {}",
            KEY_LENGTH,
            bytes.len()
        ))
    })
}

/// A peer's public key, usable only for verification and key agreement.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerPublicKey {
    key: PublicKey,
}

impl PeerPublicKey {
    /// Imports a serialized public key, failing with `InvalidKey` on
    /// malformed input.
    pub fn import(jwk: &Jwk) -> Result<Self> {
        let key = jwk.to_public_key()?;
        Ok(Self::from_key(key))
    }

    fn from_key(key: PublicKey) -> Self {
        Self { key }
    }

    /// Derives the numeric identifier this key hashes to.
    pub fn numeric_id(&self) -> NumericId {
        NumericId::from_public_key(&self.key)
    }

    /// Returns whether this key hashes to `claimed`.
    pub fn matches(&self, claimed: &NumericId) -> bool {
        &self.numeric_id() == claimed
    }

    pub(crate) fn as_dalek(&self) -> &PublicKey {
        &self.key
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        self.key.as_bytes()
    }
}

impl std::fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPublicKey")
            .field("numeric_id", &self.numeric_id())
            .finish()
    }
}

/// Portable login credential payload, base64-encoded JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialPayload {
    phone_number: String,
    private_key: Jwk,
    public_key: Jwk,
}

/// The local user's identity, including the private key.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public_key: PublicKey,
    numeric_id: NumericId,
}

impl Identity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public_key = PublicKey::from(&secret);
        let numeric_id = NumericId::from_public_key(&public_key);
        Self {
            secret,
            public_key,
            numeric_id,
        }
    }

    /// Reconstructs an identity from a login credential.
    ///
    /// The credential must decode, parse and carry a private key whose
    /// public half and numeric id agree with the embedded values.
    pub fn import(credential: &str) -> Result<Self> {
        let json = STANDARD
            .decode(credential.trim())
            .map_err(|e| ProtocolError::InvalidCredential(format!("invalid base64: {}", e)))?;
        let payload: CredentialPayload = serde_json::from_slice(&json)
            .map_err(|e| ProtocolError::InvalidCredential(format!("invalid payload: {}", e)))?;
        Self::from_jwks(&payload.phone_number, &payload.private_key, &payload.public_key)
    }

    /// Reconstructs an identity from its JWK parts, as found in backup bundles.
    pub fn from_jwks(phone_number: &str, private_key: &Jwk, public_key: &Jwk) -> Result<Self> {
        let secret = private_key
            .to_secret()
            .map_err(|e| ProtocolError::InvalidCredential(e.to_string()))?;
        let declared = public_key
            .to_public_key()
            .map_err(|e| ProtocolError::InvalidCredential(e.to_string()))?;

        let identity = Self::from_secret(secret);
        if identity.public_key != declared {
            return Err(ProtocolError::InvalidCredential(
                "private key does not match public key".to_string(),
            ));
        }
        if identity.numeric_id.as_str() != phone_number {
            return Err(ProtocolError::InvalidCredential(format!(
                "numeric id {} does not match key-derived id {}",
                phone_number, identity.numeric_id
            )));
        }
        Ok(identity)
    }

    /// Encodes this identity as a portable login credential.
    pub fn login_credential(&self) -> String {
        let payload = CredentialPayload {
            phone_number: self.numeric_id.to_string(),
            private_key: self.private_key_jwk(),
            public_key: self.public_key_jwk(),
        };
        // Serializing plain strings into JSON cannot fail.
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Returns the numeric identifier.
    pub fn numeric_id(&self) -> &NumericId {
        &self.numeric_id
    }

    /// Returns the `#DDD DDD DDD` display form of the numeric identifier.
    pub fn display_form(&self) -> String {
        self.numeric_id.display_form()
    }

    /// Returns the public key as a JWK.
    pub fn public_key_jwk(&self) -> Jwk {
        Jwk::from_public(&self.public_key)
    }

    /// Returns the private key as a JWK.
    ///
    /// **Security Warning**: the result contains secret key material.
    pub fn private_key_jwk(&self) -> Jwk {
        Jwk::from_secret(&self.secret, &self.public_key)
    }

    /// Returns this identity as a peer would see it.
    pub fn to_peer_public_key(&self) -> PeerPublicKey {
        PeerPublicKey::from_key(self.public_key)
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("numeric_id", &self.numeric_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}
