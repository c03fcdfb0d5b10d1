//! Session buffer on an embedded sled tree
//!
//! Entries are JSON values keyed by the session token. Mutations go through
//! `update_and_fetch`, which retries the closure until its compare-and-swap
//! wins.

use async_trait::async_trait;
use sled::{IVec, Tree};
use std::path::Path;

use super::{BufferEntry, SessionBuffer};
use crate::error::{ChatRelayError, Result};
use crate::session::{Message, SessionKey};

const TREE_NAME: &str = "session_buffer";

/// Session buffer persisted in sled
pub struct SledSessionBuffer {
    tree: Tree,
}

impl SledSessionBuffer {
    /// Open or create the buffer at `path`
    ///
    /// # Errors
    ///
    /// Returns `ChatRelayError::Buffer` if the database cannot be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| ChatRelayError::Buffer(format!("Failed to open buffer: {}", e)))?;
        Self::from_db(&db)
    }

    /// Use a tree of an already opened database
    pub fn from_db(db: &sled::Db) -> Result<Self> {
        let tree = db
            .open_tree(TREE_NAME)
            .map_err(|e| ChatRelayError::Buffer(format!("Failed to open tree: {}", e)))?;
        Ok(Self { tree })
    }

    /// Applies `change` atomically to the session's entry.
    ///
    /// `change` receives the current entry and returns the next one, or
    /// `None` to remove the entry. It may run more than once under
    /// contention.
    fn modify<F>(&self, key: &SessionKey, mut change: F) -> Result<Option<BufferEntry>>
    where
        F: FnMut(Option<BufferEntry>) -> Option<BufferEntry>,
    {
        let mut failure: Option<String> = None;

        let updated = self
            .tree
            .update_and_fetch(key.token().as_bytes(), |old| {
                failure = None;
                let current = match old.map(serde_json::from_slice::<BufferEntry>).transpose() {
                    Ok(current) => current,
                    Err(e) => {
                        failure = Some(format!("Corrupt buffer entry: {}", e));
                        return old.map(IVec::from);
                    }
                };
                match change(current) {
                    Some(next) => match serde_json::to_vec(&next) {
                        Ok(bytes) => Some(IVec::from(bytes)),
                        Err(e) => {
                            failure = Some(format!("Failed to encode buffer entry: {}", e));
                            old.map(IVec::from)
                        }
                    },
                    None => None,
                }
            })
            .map_err(|e| ChatRelayError::Buffer(format!("Failed to update {}: {}", key, e)))?;

        if let Some(reason) = failure {
            return Err(ChatRelayError::Buffer(reason).into());
        }

        updated
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(|e| ChatRelayError::Buffer(format!("Corrupt buffer entry: {}", e)).into())
    }
}

#[async_trait]
impl SessionBuffer for SledSessionBuffer {
    async fn get(&self, key: &SessionKey) -> Result<Option<BufferEntry>> {
        let value = self
            .tree
            .get(key.token().as_bytes())
            .map_err(|e| ChatRelayError::Buffer(format!("Failed to read {}: {}", key, e)))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                ChatRelayError::Buffer(format!("Corrupt buffer entry: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    async fn append(&self, key: &SessionKey, message: Message) -> Result<usize> {
        let updated = self.modify(key, |current| {
            let mut entry = current.unwrap_or_default();
            entry.push(message.clone());
            Some(entry)
        })?;
        Ok(updated.map(|entry| entry.messages.len()).unwrap_or(0))
    }

    async fn set_summary(&self, key: &SessionKey, summary: &str) -> Result<()> {
        self.modify(key, |current| {
            let mut entry = current.unwrap_or_default();
            entry.summary = summary.to_string();
            Some(entry)
        })?;
        Ok(())
    }

    async fn truncate_flushed(&self, key: &SessionKey, flushed: &[String]) -> Result<()> {
        self.modify(key, |current| {
            current.map(|mut entry| {
                entry.remove_flushed(flushed);
                entry
            })
        })?;
        Ok(())
    }

    async fn delete_flushed(&self, key: &SessionKey, flushed: &[String]) -> Result<bool> {
        let remaining = self.modify(key, |current| {
            current.and_then(|mut entry| {
                entry.remove_flushed(flushed);
                if entry.messages.is_empty() {
                    None
                } else {
                    Some(entry)
                }
            })
        })?;
        Ok(remaining.is_none())
    }
}
