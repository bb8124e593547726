//! Local address book mapping numeric ids to display names.

use std::collections::BTreeMap;

use protocol::NumericId;
use serde::{Deserialize, Serialize};

/// Display names chosen by the user for their peers.
///
/// Serialized as a plain JSON object `{ "123456789": "Alice" }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactBook {
    entries: BTreeMap<NumericId, String>,
}

impl ContactBook {
    /// Creates an empty contact book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names `peer`, returning the previous name. An empty name removes the
    /// entry.
    pub fn set(&mut self, peer: NumericId, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return self.entries.remove(&peer);
        }
        self.entries.insert(peer, name.to_string())
    }

    /// Removes the name for `peer`.
    pub fn remove(&mut self, peer: &NumericId) -> Option<String> {
        self.entries.remove(peer)
    }

    /// Returns the name for `peer`.
    pub fn name(&self, peer: &NumericId) -> Option<&str> {
        self.entries.get(peer).map(String::as_str)
    }

    /// Returns the name for `peer`, or its display form if unnamed.
    pub fn label(&self, peer: &NumericId) -> String {
        self.name(peer)
            .map(str::to_string)
            .unwrap_or_else(|| peer.display_form())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NumericId, &str)> {
        self.entries.iter().map(|(id, name)| (id, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> NumericId {
        NumericId::new(value).unwrap()
    }

    #[test]
    fn test_set_and_label() {
        let mut book = ContactBook::new();
        assert_eq!(book.label(&id("123456789")), "#123 456 789");

        assert!(book.set(id("123456789"), "  Alice ").is_none());
        assert_eq!(book.name(&id("123456789")), Some("Alice"));
        assert_eq!(book.label(&id("123456789")), "Alice");

        assert_eq!(book.set(id("123456789"), "Al").as_deref(), Some("Alice"));
    }

    #[test]
    fn test_empty_name_removes() {
        let mut book = ContactBook::new();
        book.set(id("123456789"), "Alice");
        book.set(id("123456789"), "   ");
        assert!(book.is_empty());
    }

    #[test]
    fn test_json_is_plain_object() {
        let mut book = ContactBook::new();
        book.set(id("123456789"), "Alice");
        book.set(id("000000001"), "Bob");

        let json = serde_json::to_string(&book).unwrap();
        assert_eq!(json, r#"{"000000001":"Bob","123456789":"Alice"}"#);

        let parsed: ContactBook = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, book);
        assert_eq!(parsed.iter().count(), 2);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(serde_json::from_str::<ContactBook>(r#"{"abc":"x"}"#).is_err());
    }
}
