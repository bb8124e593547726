//! Per-peer sessions.
//!
//! This module provides:
//! - [`state`]: The session lifecycle as a pure transition function
//! - [`peer`]: `PeerSession`, which owns the transport handle, the shared
//!   secret and the message history for one peer

pub mod peer;
pub mod state;

use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{Message, NumericId};
use serde::{Deserialize, Serialize};

pub use peer::{PeerSession, SessionOutput};
pub use state::{transition, Effect, SessionEvent, SessionState};

/// Persisted form of a session, as stored in the sessions blob and in
/// backup bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Peer numeric id.
    pub id: NumericId,
    /// Message history in order.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Session status. Always `disconnected` when written.
    #[serde(default = "disconnected")]
    pub status: SessionState,
    /// Unread message count.
    #[serde(default)]
    pub unread: u32,
    /// Preview of the last message.
    #[serde(default)]
    pub last_message: String,
    /// Last activity in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

fn disconnected() -> SessionState {
    SessionState::Disconnected
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{MessagePayload, Sender};

    #[test]
    fn test_chat_record_json_shape() {
        let record = ChatRecord {
            id: NumericId::new("123456789").unwrap(),
            messages: vec![Message::new(Sender::Peer, MessagePayload::text("hey"), 10)],
            status: SessionState::Disconnected,
            unread: 2,
            last_message: "hey".to_string(),
            timestamp: 10,
        };
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["id"], "123456789");
        assert_eq!(value["status"], "disconnected");
        assert_eq!(value["lastMessage"], "hey");
        assert_eq!(value["messages"][0]["sender"], "them");
        assert_eq!(value["messages"][0]["content"]["type"], "text");
    }

    #[test]
    fn test_chat_record_defaults() {
        let record: ChatRecord = serde_json::from_str(r#"{"id":"123456789"}"#).unwrap();
        assert!(record.messages.is_empty());
        assert_eq!(record.status, SessionState::Disconnected);
        assert_eq!(record.unread, 0);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in epoch milliseconds.
        assert!(now_millis() > 1_577_836_800_000);
    }
}
