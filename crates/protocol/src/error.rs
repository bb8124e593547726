//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Identity errors
    /// A login credential could not be decoded, parsed or imported.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Invalid or malformed public key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A string is not a 9-digit numeric identifier.
    #[error("invalid numeric id: {0:?}")]
    InvalidNumericId(String),

    // Handshake errors
    /// The peer's public key does not hash to the id the transport reported.
    #[error("identity mismatch: peer claims {expected} but its key derives {actual}")]
    IdentityMismatch {
        /// The id associated with the transport connection.
        expected: String,
        /// The id derived from the presented public key.
        actual: String,
    },

    /// Handshake failed for a reason other than an identity mismatch.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption or authentication failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Payload errors
    /// A binary attachment exceeds the size ceiling.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual attachment size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true for errors that should be reported to the user as a
    /// security alert rather than a plain connection failure.
    ///
    /// Only a peer presenting a key that is not the one behind its id, or no
    /// usable key at all, qualifies. Frames out of order are plain failures.
    pub fn is_security_alert(&self) -> bool {
        matches!(
            self,
            ProtocolError::IdentityMismatch { .. } | ProtocolError::InvalidKey(_)
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_credential_display() {
        let err = ProtocolError::InvalidCredential("not base64".to_string());
        assert_eq!(err.to_string(), "invalid credential: not base64");
    }

    #[test]
    fn test_invalid_key_display() {
        let err = ProtocolError::InvalidKey("wrong key length".to_string());
        assert_eq!(err.to_string(), "invalid key: wrong key length");
    }

    #[test]
    fn test_invalid_numeric_id_display() {
        let err = ProtocolError::InvalidNumericId("12345".to_string());
        assert_eq!(err.to_string(), "invalid numeric id: \"12345\"");
    }

    #[test]
    fn test_identity_mismatch_display() {
        let err = ProtocolError::IdentityMismatch {
            expected: "123456789".to_string(),
            actual: "987654321".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "identity mismatch: peer claims 123456789 but its key derives 987654321"
        );
    }

    #[test]
    fn test_payload_too_large_display() {
        let err = ProtocolError::PayloadTooLarge {
            size: 6_000_000,
            max: 5_242_880,
        };
        assert_eq!(
            err.to_string(),
            "payload too large: 6000000 bytes exceeds maximum of 5242880 bytes"
        );
    }

    #[test]
    fn test_security_alert_classification() {
        assert!(ProtocolError::IdentityMismatch {
            expected: "1".into(),
            actual: "2".into()
        }
        .is_security_alert());
        assert!(ProtocolError::InvalidKey("low order".into()).is_security_alert());
        assert!(!ProtocolError::HandshakeFailed("x".into()).is_security_alert());
        assert!(!ProtocolError::Decryption("tag".into()).is_security_alert());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<()> {
            Ok(())
        }
        assert!(returns_result().is_ok());
    }
}
