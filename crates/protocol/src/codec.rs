//! Encryption of message payloads into `msg` frames and back.

use crate::aead::NONCE_LENGTH;
use crate::error::{ProtocolError, Result};
use crate::handshake::SharedSecret;
use crate::messages::{EncryptedPayload, MessagePayload, WireFrame, MAX_ATTACHMENT_SIZE};

/// Checks the attachment size ceiling for binary payloads.
pub fn check_size(payload: &MessagePayload) -> Result<()> {
    match payload.attachment_size() {
        Some(size) if size > MAX_ATTACHMENT_SIZE => Err(ProtocolError::PayloadTooLarge {
            size,
            max: MAX_ATTACHMENT_SIZE,
        }),
        _ => Ok(()),
    }
}

/// Serializes and encrypts `payload` under `secret`.
///
/// Oversized attachments are rejected before any encryption happens.
pub fn encrypt_payload(secret: &SharedSecret, payload: &MessagePayload) -> Result<EncryptedPayload> {
    check_size(payload)?;

    let plaintext = serde_json::to_vec(payload)?;
    let sealed = secret.key().seal(&plaintext)?;

    Ok(EncryptedPayload {
        iv: hex::encode(sealed.nonce),
        ciphertext: hex::encode(sealed.ciphertext),
    })
}

/// Decrypts and decodes an encrypted payload.
///
/// Malformed hex, a wrong key or any tampering fail with
/// [`ProtocolError::Decryption`]. Plaintext that is not a tagged payload is
/// returned as text.
pub fn decrypt_payload(secret: &SharedSecret, payload: &EncryptedPayload) -> Result<MessagePayload> {
    let nonce = hex::decode(&payload.iv)
        .map_err(|e| ProtocolError::Decryption(format!("invalid iv encoding: {}", e)))?;
    if nonce.len() != NONCE_LENGTH {
        return Err(ProtocolError::Decryption(format!(
            "invalid iv length: {}",
            nonce.len()
        )));
    }
    let ciphertext = hex::decode(&payload.ciphertext)
        .map_err(|e| ProtocolError::Decryption(format!("invalid ciphertext encoding: {}", e)))?;

    let plaintext = secret.key().open(&nonce, &ciphertext)?;
    let text = String::from_utf8(plaintext)
        .map_err(|_| ProtocolError::Decryption("plaintext is not valid UTF-8".to_string()))?;

    Ok(MessagePayload::from_plaintext(&text))
}

/// Builds a complete `msg` frame for `payload`.
pub fn seal_message(secret: &SharedSecret, payload: &MessagePayload) -> Result<WireFrame> {
    Ok(WireFrame::Msg {
        payload: encrypt_payload(secret, payload)?,
    })
}

/// Opens the payload of a `msg` frame.
///
/// Handshake frames are not messages and yield a deserialization error.
pub fn open_message(secret: &SharedSecret, frame: &WireFrame) -> Result<MessagePayload> {
    match frame {
        WireFrame::Msg { payload } => decrypt_payload(secret, payload),
        other => Err(ProtocolError::Deserialization(format!(
            "expected msg frame, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::derive_shared_secret;
    use crate::identity::Identity;

    fn shared_pair() -> (SharedSecret, SharedSecret) {
        let a = Identity::generate();
        let b = Identity::generate();
        (
            derive_shared_secret(&a, &b.to_peer_public_key()).unwrap(),
            derive_shared_secret(&b, &a.to_peer_public_key()).unwrap(),
        )
    }

    #[test]
    fn test_peer_decrypts_text() {
        let (ours, theirs) = shared_pair();
        let frame = seal_message(&ours, &MessagePayload::text("hello")).unwrap();
        let opened = open_message(&theirs, &frame).unwrap();
        assert_eq!(opened, MessagePayload::text("hello"));
    }

    #[test]
    fn test_peer_decrypts_image() {
        let (ours, theirs) = shared_pair();
        let image = MessagePayload::Image {
            content: "data:image/png;base64,iVBORw0KGgo=".to_string(),
            file_name: Some("dot.png".to_string()),
        };
        let frame = seal_message(&ours, &image).unwrap();
        assert_eq!(open_message(&theirs, &frame).unwrap(), image);
    }

    #[test]
    fn test_payload_is_hex() {
        let (ours, _) = shared_pair();
        let payload = encrypt_payload(&ours, &MessagePayload::text("x")).unwrap();
        assert_eq!(payload.iv.len(), NONCE_LENGTH * 2);
        assert!(payload.iv.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(payload.ciphertext.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let (ours, _) = shared_pair();
        let (outsider, _) = shared_pair();
        let frame = seal_message(&ours, &MessagePayload::text("private")).unwrap();
        assert!(matches!(
            open_message(&outsider, &frame),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (ours, theirs) = shared_pair();
        let mut payload = encrypt_payload(&ours, &MessagePayload::text("integrity")).unwrap();

        let mut bytes = hex::decode(&payload.ciphertext).unwrap();
        bytes[0] ^= 0x80;
        payload.ciphertext = hex::encode(bytes);

        assert!(matches!(
            decrypt_payload(&theirs, &payload),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn test_malformed_hex_rejected() {
        let (ours, theirs) = shared_pair();
        let mut payload = encrypt_payload(&ours, &MessagePayload::text("x")).unwrap();
        payload.iv = "zz".repeat(NONCE_LENGTH);
        assert!(matches!(
            decrypt_payload(&theirs, &payload),
            Err(ProtocolError::Decryption(_))
        ));

        let mut payload = encrypt_payload(&ours, &MessagePayload::text("x")).unwrap();
        payload.iv = "00".repeat(4);
        assert!(decrypt_payload(&theirs, &payload).is_err());
    }

    #[test]
    fn test_oversized_attachment_rejected() {
        let (ours, _) = shared_pair();
        let audio = MessagePayload::Audio {
            content: "a".repeat(MAX_ATTACHMENT_SIZE + 1),
        };
        assert!(matches!(
            seal_message(&ours, &audio),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_attachment_at_limit_accepted() {
        let image = MessagePayload::Image {
            content: "a".repeat(MAX_ATTACHMENT_SIZE),
            file_name: None,
        };
        assert!(check_size(&image).is_ok());
    }

    fn data_url(decoded_bytes: usize) -> String {
        format!(
            "data:image/jpeg;base64,{}",
            "A".repeat(decoded_bytes.div_ceil(3) * 4)
        )
    }

    #[test]
    fn test_limit_applies_to_file_size_not_encoding() {
        // 4 MiB of file data encodes to more than 5 MiB of base64.
        let content = data_url(4 * 1024 * 1024);
        assert!(content.len() > MAX_ATTACHMENT_SIZE);
        let image = MessagePayload::Image {
            content,
            file_name: Some("photo.jpg".into()),
        };
        assert!(check_size(&image).is_ok());

        let image = MessagePayload::Image {
            content: data_url(MAX_ATTACHMENT_SIZE + 1),
            file_name: None,
        };
        assert!(matches!(
            check_size(&image),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_long_text_not_size_limited() {
        let text = MessagePayload::text("a".repeat(MAX_ATTACHMENT_SIZE + 1));
        assert!(check_size(&text).is_ok());
    }

    #[test]
    fn test_legacy_plain_text_fallback() {
        let (ours, theirs) = shared_pair();
        let sealed = ours.key().seal(b"just a string").unwrap();
        let payload = EncryptedPayload {
            iv: hex::encode(sealed.nonce),
            ciphertext: hex::encode(sealed.ciphertext),
        };
        assert_eq!(
            decrypt_payload(&theirs, &payload).unwrap(),
            MessagePayload::text("just a string")
        );
    }

    #[test]
    fn test_open_rejects_handshake_frame() {
        let (ours, _) = shared_pair();
        let frame = WireFrame::HandshakeSyn {
            public_key: Identity::generate().public_key_jwk(),
        };
        assert!(open_message(&ours, &frame).is_err());
    }
}
