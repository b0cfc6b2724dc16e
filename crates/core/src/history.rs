//! Conversation history types.
//!
//! The session client owns the history log and appends to it as turns
//! complete; everyone else gets a read-only view. Trimming the log to fit a
//! context window is a read-time projection ([`recent`]), never a mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a history entry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One exchanged turn in a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default = "HistoryEntry::stamp")]
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Self::stamp(),
        }
    }

    fn stamp() -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns the trailing `limit` entries without copying or mutating the log.
pub fn recent(entries: &[HistoryEntry], limit: usize) -> &[HistoryEntry] {
    &entries[entries.len().saturating_sub(limit)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(format!("{}", Role::User), "user");
        assert_eq!(format!("{}", Role::Assistant), "assistant");
        assert_eq!(format!("{}", Role::System), "system");
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = HistoryEntry::new(Role::User, "what is a linked list?");
        let json = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_entry_without_timestamp_gets_one() {
        // Gateway history payloads may omit timestamps.
        let entry: HistoryEntry =
            serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(entry.role, Role::Assistant);
        assert_eq!(entry.content, "hi");
    }

    #[test]
    fn test_recent_is_a_projection() {
        let entries: Vec<HistoryEntry> = (0..5)
            .map(|i| HistoryEntry::new(Role::User, format!("message {i}")))
            .collect();

        let window = recent(&entries, 2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "message 3");
        assert_eq!(window[1].content, "message 4");

        // The source log is untouched.
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn test_recent_with_oversized_limit() {
        let entries = vec![HistoryEntry::new(Role::User, "only one")];
        assert_eq!(recent(&entries, 10).len(), 1);
        assert_eq!(recent(&[], 10).len(), 0);
    }
}
