//! Wire frame and message payload definitions.
//!
//! Frames travel over the transport's data channel as one JSON object each:
//!
//! ```text
//! {"type":"handshake-syn","publicKey":{...}}
//! {"type":"handshake-ack","publicKey":{...}}
//! {"type":"msg","payload":{"iv":"<hex>","ciphertext":"<hex>"}}
//! ```
//!
//! The plaintext inside a `msg` frame is a [`MessagePayload`], itself a JSON
//! object tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::Jwk;

/// Maximum size of an image or audio file before encoding (5 MiB).
pub const MAX_ATTACHMENT_SIZE: usize = 5 * 1024 * 1024;

/// A single frame on the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireFrame {
    /// First handshake message, sent by the initiator.
    #[serde(rename = "handshake-syn")]
    HandshakeSyn {
        /// The sender's public key.
        #[serde(rename = "publicKey")]
        public_key: Jwk,
    },
    /// Handshake reply, sent by the responder after verifying the `Syn`.
    #[serde(rename = "handshake-ack")]
    HandshakeAck {
        /// The sender's public key.
        #[serde(rename = "publicKey")]
        public_key: Jwk,
    },
    /// An encrypted application message.
    #[serde(rename = "msg")]
    Msg {
        /// Nonce and ciphertext.
        payload: EncryptedPayload,
    },
}

impl WireFrame {
    /// Serializes the frame to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a frame from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns whether this is one of the two handshake frames.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            WireFrame::HandshakeSyn { .. } | WireFrame::HandshakeAck { .. }
        )
    }

    /// Returns the frame's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::HandshakeSyn { .. } => "handshake-syn",
            WireFrame::HandshakeAck { .. } => "handshake-ack",
            WireFrame::Msg { .. } => "msg",
        }
    }
}

/// Hex-encoded AEAD output carried by a `msg` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// 12-byte nonce, hex-encoded.
    pub iv: String,
    /// Ciphertext with appended tag, hex-encoded.
    pub ciphertext: String,
}

/// Application content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    /// Plain text.
    Text {
        /// The text.
        content: String,
    },
    /// An image, usually a data URL.
    Image {
        /// Encoded image data.
        content: String,
        /// Original file name, if known.
        #[serde(
            rename = "fileName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        file_name: Option<String>,
    },
    /// A voice message, usually a data URL.
    Audio {
        /// Encoded audio data.
        content: String,
    },
}

impl MessagePayload {
    /// Creates a text payload.
    pub fn text(content: impl Into<String>) -> Self {
        MessagePayload::Text {
            content: content.into(),
        }
    }

    /// Decodes a decrypted plaintext.
    ///
    /// Plaintext that is not a recognized tagged payload (plain strings,
    /// foreign JSON, unknown `type` values) becomes a `Text` payload holding
    /// the whole string. Older clients sent bare text, so this branch keeps
    /// them readable.
    pub fn from_plaintext(plaintext: &str) -> Self {
        match serde_json::from_str::<MessagePayload>(plaintext) {
            Ok(payload) => payload,
            Err(_) => MessagePayload::text(plaintext),
        }
    }

    /// Returns the size in bytes of binary content, or `None` for text.
    ///
    /// For a base64 data URL this is the size of the file it carries, not of
    /// the encoded string. Any other content counts byte for byte.
    pub fn attachment_size(&self) -> Option<usize> {
        match self {
            MessagePayload::Text { .. } => None,
            MessagePayload::Image { content, .. } | MessagePayload::Audio { content } => {
                Some(decoded_size(content))
            }
        }
    }

    /// Returns the chat-list preview for this payload.
    pub fn preview(&self) -> String {
        match self {
            MessagePayload::Text { content } => content.clone(),
            MessagePayload::Image { .. } => "📷 Image".to_string(),
            MessagePayload::Audio { .. } => "🎤 Voice message".to_string(),
        }
    }
}

/// Size of the bytes behind a `data:...;base64,` URL, without decoding it.
fn decoded_size(content: &str) -> usize {
    match content.split_once(";base64,") {
        Some((header, data)) if header.starts_with("data:") => {
            let data = data.trim_end();
            let padding = data.bytes().rev().take_while(|&b| b == b'=').count();
            (data.len() - padding) * 3 / 4
        }
        _ => content.len(),
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    /// The local user.
    #[serde(rename = "me")]
    Local,
    /// The remote peer.
    #[serde(rename = "them")]
    Peer,
}

/// An entry in a session's history. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message.
    pub sender: Sender,
    /// Message content.
    pub content: MessagePayload,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    /// Creates a message stamped with the given time.
    pub fn new(sender: Sender, content: MessagePayload, timestamp: i64) -> Self {
        Self {
            sender,
            content,
            timestamp,
        }
    }
}
