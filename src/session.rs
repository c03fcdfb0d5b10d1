//! Session identity and conversation messages
//!
//! A session is the `(userId, chatId)` pair. It has no storage record of its
//! own; it is the composite key used for routing, buffering and connection
//! ownership.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Separator between user id and chat id in a rendered session token
pub const TOKEN_SEPARATOR: char = '_';

/// Composite session key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Owning user
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Chat within the user's account
    #[serde(rename = "chatId")]
    pub chat_id: String,
}

impl SessionKey {
    /// Creates a session key from its two halves
    ///
    /// # Examples
    ///
    /// ```
    /// use chatrelay::session::SessionKey;
    ///
    /// let key = SessionKey::new("u1", "c1");
    /// assert_eq!(key.token(), "u1_c1");
    /// ```
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Renders the session as a single routing token (`{userId}_{chatId}`)
    ///
    /// This token is the partition key for `user_query`, `server_reply` and
    /// `db_ops`, which keeps every hop of one session on one partition.
    pub fn token(&self) -> String {
        format!("{}{}{}", self.user_id, TOKEN_SEPARATOR, self.chat_id)
    }

    /// Parses a routing token back into a session key
    ///
    /// The split happens on the first separator. Returns `None` when either
    /// half is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatrelay::session::SessionKey;
    ///
    /// let key = SessionKey::from_token("u1_c1").unwrap();
    /// assert_eq!(key.user_id, "u1");
    /// assert_eq!(key.chat_id, "c1");
    /// assert!(SessionKey::from_token("nounderscore").is_none());
    /// ```
    pub fn from_token(token: &str) -> Option<Self> {
        let (user_id, chat_id) = token.split_once(TOKEN_SEPARATOR)?;
        if user_id.is_empty() || chat_id.is_empty() {
            return None;
        }
        Some(Self::new(user_id, chat_id))
    }

    /// Returns true when both halves are non-empty and the user id has no
    /// separator
    ///
    /// A separator in the user id would let two sessions render the same
    /// token, e.g. `("a_b", "c")` and `("a", "b_c")`. Chat ids may contain
    /// it since the token splits on the first separator.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatrelay::session::SessionKey;
    ///
    /// assert!(SessionKey::new("a", "b_c").is_valid());
    /// assert!(!SessionKey::new("a_b", "c").is_valid());
    /// ```
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty()
            && !self.chat_id.is_empty()
            && !self.user_id.contains(TOKEN_SEPARATOR)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Text typed by the user
    User,
    /// Text assembled from generation chunks
    #[serde(alias = "ai")]
    Assistant,
}

impl Role {
    /// Upper-case label used when rendering transcripts into prompts
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

/// One conversation message; unique by `msg_id` within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id
    #[serde(rename = "msgId")]
    pub msg_id: String,
    /// Author
    pub role: Role,
    /// Message text
    pub content: String,
    /// Creation time (RFC-3339)
    pub timestamp: String,
}

impl Message {
    /// Creates a user message with a fresh id and the current timestamp
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_id(new_message_id(), Role::User, content)
    }

    /// Creates an assistant message with a fresh id and the current timestamp
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_id(new_message_id(), Role::Assistant, content)
    }

    /// Creates a message with an explicit id
    pub fn with_id(msg_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            role,
            content: content.into(),
            timestamp: now_rfc3339(),
        }
    }
}

/// Generates a new sortable message id
pub fn new_message_id() -> String {
    Ulid::new().to_string()
}

/// Current UTC time formatted as RFC-3339
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let key = SessionKey::new("user-1", "chat-9");
        assert_eq!(SessionKey::from_token(&key.token()), Some(key));
    }

    #[test]
    fn test_from_token_rejects_empty_halves() {
        assert!(SessionKey::from_token("_chat").is_none());
        assert!(SessionKey::from_token("user_").is_none());
        assert!(SessionKey::from_token("").is_none());
    }

    #[test]
    fn test_from_token_splits_on_first_separator() {
        let key = SessionKey::from_token("u_c_extra").unwrap();
        assert_eq!(key.user_id, "u");
        assert_eq!(key.chat_id, "c_extra");
    }

    #[test]
    fn test_separator_in_user_id_is_invalid() {
        let left = SessionKey::new("a_b", "c");
        let right = SessionKey::new("a", "b_c");
        assert_eq!(left.token(), right.token());
        assert!(!left.is_valid());
        assert!(right.is_valid());
        assert_eq!(SessionKey::from_token(&right.token()), Some(right));
    }

    #[test]
    fn test_valid_keys_render_distinct_tokens() {
        let keys = [
            SessionKey::new("a", "b_c"),
            SessionKey::new("a", "b"),
            SessionKey::new("ab", "c"),
            SessionKey::new("a-b", "c"),
        ];
        for (i, a) in keys.iter().enumerate() {
            assert!(a.is_valid());
            assert_eq!(SessionKey::from_token(&a.token()).as_ref(), Some(a));
            for b in &keys[i + 1..] {
                assert_ne!(a.token(), b.token());
            }
        }
    }

    #[test]
    fn test_role_accepts_ai_alias() {
        let role: Role = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(role, Role::Assistant);
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn test_message_serializes_camel_case_id() {
        let msg = Message::with_id("m1", Role::User, "hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["msgId"], "m1");
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::user("a");
        let b = Message::user("a");
        assert_ne!(a.msg_id, b.msg_id);
    }
}
