//! In-process session buffer

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BufferEntry, SessionBuffer};
use crate::error::{ChatRelayError, Result};
use crate::session::{Message, SessionKey};

/// Session buffer kept in a mutex-guarded map
#[derive(Default)]
pub struct MemorySessionBuffer {
    entries: Mutex<HashMap<SessionKey, BufferEntry>>,
}

impl MemorySessionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<SessionKey, BufferEntry>) -> T) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ChatRelayError::Buffer("buffer lock poisoned".to_string()))?;
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl SessionBuffer for MemorySessionBuffer {
    async fn get(&self, key: &SessionKey) -> Result<Option<BufferEntry>> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    async fn append(&self, key: &SessionKey, message: Message) -> Result<usize> {
        self.with_entries(|entries| entries.entry(key.clone()).or_default().push(message))
    }

    async fn set_summary(&self, key: &SessionKey, summary: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.entry(key.clone()).or_default().summary = summary.to_string();
        })
    }

    async fn truncate_flushed(&self, key: &SessionKey, flushed: &[String]) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.remove_flushed(flushed);
            }
        })
    }

    async fn delete_flushed(&self, key: &SessionKey, flushed: &[String]) -> Result<bool> {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(key) else {
                return true;
            };
            entry.remove_flushed(flushed);
            if entry.messages.is_empty() {
                entries.remove(key);
                true
            } else {
                false
            }
        })
    }
}
