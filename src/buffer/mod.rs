//! Session state buffer
//!
//! Write-behind cache holding, per session, the messages not yet merged into
//! the durable chat log plus the rolling summary. Entries never expire; they
//! shrink on flush and disappear on delete.
//!
//! Every mutation is an atomic read-modify-write on one session's entry, so
//! overlapping writers for a session cannot lose each other's updates.

pub mod memory;
pub mod sled;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::Result;
use crate::session::{Message, SessionKey};

pub use self::memory::MemorySessionBuffer;
pub use self::sled::SledSessionBuffer;

/// Buffered state of one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferEntry {
    /// Rolling summary; survives flushes
    #[serde(default)]
    pub summary: String,
    /// Messages appended since the last flush, in insertion order
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl BufferEntry {
    /// True when there is neither a summary nor any message
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.messages.is_empty()
    }

    /// The last `n` messages, oldest first
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Ids of the buffered messages
    pub fn message_ids(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.msg_id.clone()).collect()
    }

    /// Appends `message` unless one with the same id is already buffered.
    /// Returns the message count afterwards.
    pub fn push(&mut self, message: Message) -> usize {
        if !self.messages.iter().any(|m| m.msg_id == message.msg_id) {
            self.messages.push(message);
        }
        self.messages.len()
    }

    /// Drops the messages whose ids are in `flushed`, keeping the summary
    /// and anything appended after the flush read them.
    pub fn remove_flushed(&mut self, flushed: &[String]) {
        let flushed: HashSet<&str> = flushed.iter().map(String::as_str).collect();
        self.messages
            .retain(|m| !flushed.contains(m.msg_id.as_str()));
    }
}

/// Per-session ephemeral store
#[async_trait]
pub trait SessionBuffer: Send + Sync {
    /// Current entry, `None` when the session has nothing buffered
    async fn get(&self, key: &SessionKey) -> Result<Option<BufferEntry>>;

    /// Appends a message (idempotent by message id), creating the entry if
    /// needed. Returns the buffered message count afterwards.
    async fn append(&self, key: &SessionKey, message: Message) -> Result<usize>;

    /// Replaces the rolling summary, creating the entry if needed
    async fn set_summary(&self, key: &SessionKey, summary: &str) -> Result<()>;

    /// Removes the given messages after they were merged durably; the
    /// summary is kept
    async fn truncate_flushed(&self, key: &SessionKey, flushed: &[String]) -> Result<()>;

    /// Removes the entry after its messages were merged durably.
    ///
    /// If messages outside `flushed` arrived in the meantime, only the
    /// flushed ones are removed and `false` is returned.
    async fn delete_flushed(&self, key: &SessionKey, flushed: &[String]) -> Result<bool>;
}
