//! Durable store on an embedded sled database
//!
//! Records are JSON values in three named trees: chat logs keyed by session
//! token, memory records keyed by memory id and file records keyed by file
//! id. Every write is followed by a flush to disk.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, IVec, Tree};
use std::path::Path;

use super::{ChatRecord, ChatStore, DurableContext, FileRecord, FileStore, MemoryRecord};
use crate::error::{ChatRelayError, Result};
use crate::session::{now_rfc3339, Message, SessionKey};

/// sled-backed chat, memory and file store
pub struct SledStore {
    db: Db,
    chats: Tree,
    memories: Tree,
    files: Tree,
}

impl SledStore {
    /// Open or create the store at `path`
    ///
    /// # Errors
    ///
    /// Returns `ChatRelayError::Storage` if the database cannot be opened
    ///
    /// # Examples
    ///
    /// ```
    /// use chatrelay::store::SledStore;
    ///
    /// # fn main() -> chatrelay::error::Result<()> {
    /// let dir = tempfile::tempdir()?;
    /// let store = SledStore::open(dir.path())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| ChatRelayError::Storage(format!("Failed to open database: {}", e)))?;
        let open_tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| ChatRelayError::Storage(format!("Failed to open tree {}: {}", name, e)))
        };
        Ok(Self {
            chats: open_tree("chats")?,
            memories: open_tree("memories")?,
            files: open_tree("files")?,
            db,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| ChatRelayError::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>> {
        let value = tree
            .get(key.as_bytes())
            .map_err(|e| ChatRelayError::Storage(format!("Failed to read {}: {}", key, e)))?;
        value
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(|e| ChatRelayError::Storage(format!("Corrupt record {}: {}", key, e)).into())
    }

    fn write<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key.as_bytes(), bytes)
            .map_err(|e| ChatRelayError::Storage(format!("Failed to write {}: {}", key, e)))?;
        Ok(())
    }

    /// Read-modify-write of one file record; missing records are an error
    async fn update_file<F>(&self, file_id: &str, mut change: F) -> Result<()>
    where
        F: FnMut(&mut FileRecord),
    {
        let mut failure: Option<ChatRelayError> = None;
        self.files
            .update_and_fetch(file_id.as_bytes(), |old| {
                failure = None;
                let Some(bytes) = old else {
                    failure = Some(ChatRelayError::NotFound(format!("file {}", file_id)));
                    return None;
                };
                let mut record: FileRecord = match serde_json::from_slice(bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        failure = Some(ChatRelayError::Storage(format!(
                            "Corrupt file record {}: {}",
                            file_id, e
                        )));
                        return Some(IVec::from(bytes));
                    }
                };
                change(&mut record);
                match serde_json::to_vec(&record) {
                    Ok(next) => Some(IVec::from(next)),
                    Err(e) => {
                        failure = Some(ChatRelayError::Serialization(e));
                        Some(IVec::from(bytes))
                    }
                }
            })
            .map_err(|e| ChatRelayError::Storage(format!("Failed to update {}: {}", file_id, e)))?;

        match failure {
            Some(error) => Err(error.into()),
            None => self.flush().await,
        }
    }
}

#[async_trait]
impl ChatStore for SledStore {
    async fn merge_messages(
        &self,
        key: &SessionKey,
        messages: &[Message],
        summary: &str,
    ) -> Result<()> {
        let token = key.token();
        let mut failure: Option<String> = None;

        self.chats
            .update_and_fetch(token.as_bytes(), |old| {
                failure = None;
                let mut record = match old.map(serde_json::from_slice::<ChatRecord>).transpose() {
                    Ok(Some(record)) => record,
                    Ok(None) => ChatRecord {
                        user_id: key.user_id.clone(),
                        chat_id: key.chat_id.clone(),
                        ..Default::default()
                    },
                    Err(e) => {
                        failure = Some(format!("Corrupt chat record {}: {}", token, e));
                        return old.map(IVec::from);
                    }
                };
                record.merge(messages);
                record.summary = summary.to_string();
                record.updated_at = now_rfc3339();
                match serde_json::to_vec(&record) {
                    Ok(bytes) => Some(IVec::from(bytes)),
                    Err(e) => {
                        failure = Some(format!("Failed to encode chat record {}: {}", token, e));
                        old.map(IVec::from)
                    }
                }
            })
            .map_err(|e| ChatRelayError::Storage(format!("Failed to merge {}: {}", token, e)))?;

        if let Some(reason) = failure {
            return Err(ChatRelayError::Storage(reason).into());
        }
        self.flush().await
    }

    async fn recent_context(
        &self,
        key: &SessionKey,
        limit: usize,
    ) -> Result<Option<DurableContext>> {
        let record: Option<ChatRecord> = Self::read(&self.chats, &key.token())?;
        Ok(record.map(|record| {
            let start = record.messages.len().saturating_sub(limit);
            DurableContext {
                summary: record.summary,
                messages: record.messages[start..].to_vec(),
            }
        }))
    }

    async fn chat(&self, key: &SessionKey) -> Result<Option<ChatRecord>> {
        Self::read(&self.chats, &key.token())
    }

    async fn memories(&self, user_id: &str, mem_ids: &[String]) -> Result<Vec<MemoryRecord>> {
        let mut found = Vec::with_capacity(mem_ids.len());
        for mem_id in mem_ids {
            let record: Option<MemoryRecord> = Self::read(&self.memories, mem_id)?;
            if let Some(record) = record.filter(|r| r.user_id == user_id) {
                found.push(record);
            }
        }
        Ok(found)
    }

    async fn put_memory(&self, record: MemoryRecord) -> Result<()> {
        Self::write(&self.memories, &record.mem_id, &record)?;
        self.flush().await
    }
}

#[async_trait]
impl FileStore for SledStore {
    async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        Self::read(&self.files, file_id)
    }

    async fn vectorized_files(
        &self,
        key: &SessionKey,
        file_ids: &[String],
    ) -> Result<Vec<FileRecord>> {
        let mut found = Vec::new();
        for file_id in file_ids {
            let record: Option<FileRecord> = Self::read(&self.files, file_id)?;
            if let Some(record) = record {
                if record.belongs_to(key) && record.is_pdf() && record.vectorized {
                    found.push(record);
                }
            }
        }
        Ok(found)
    }

    async fn put_file(&self, record: FileRecord) -> Result<()> {
        Self::write(&self.files, &record.file_id, &record)?;
        self.flush().await
    }

    async fn mark_vectorized(&self, file_id: &str) -> Result<()> {
        self.update_file(file_id, |record| {
            record.vectorized = true;
            record.error = None;
        })
        .await
    }

    async fn mark_failed(&self, file_id: &str, error: &str) -> Result<()> {
        self.update_file(file_id, |record| {
            record.vectorized = false;
            record.error = Some(error.to_string());
        })
        .await
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.files
            .remove(file_id.as_bytes())
            .map_err(|e| ChatRelayError::Storage(format!("Failed to delete {}: {}", file_id, e)))?;
        self.flush().await
    }
}
