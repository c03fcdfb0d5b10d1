//! Durable document store
//!
//! Holds the per-session chat log (append-only messages plus the current
//! summary), the user's memory records and uploaded file records. Chat log
//! writes belong to the synchronizer; file status writes belong to the
//! vectorization worker.

pub mod sled;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::{Message, SessionKey};

pub use self::sled::SledStore;

/// MIME type of the only file kind the vectorizer accepts
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Durable chat log of one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub user_id: String,
    pub chat_id: String,
    /// Current rolling summary
    #[serde(default)]
    pub summary: String,
    /// Every merged message, each `msg_id` at most once
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub updated_at: String,
}

impl ChatRecord {
    /// Set-inserts `incoming` by message id; returns how many were new
    pub fn merge(&mut self, incoming: &[Message]) -> usize {
        let mut added = 0;
        for message in incoming {
            if !self.messages.iter().any(|m| m.msg_id == message.msg_id) {
                self.messages.push(message.clone());
                added += 1;
            }
        }
        added
    }
}

/// Summary and recent messages read from the durable log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableContext {
    pub summary: String,
    pub messages: Vec<Message>,
}

/// A user-curated memory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub mem_id: String,
    pub user_id: String,
    pub context: String,
}

/// An uploaded file and its vectorization state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub file_name: String,
    pub file_path: String,
    pub content_type: String,
    #[serde(default)]
    pub vectorized: bool,
    /// Last vectorization error, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileRecord {
    pub fn is_pdf(&self) -> bool {
        self.content_type == PDF_CONTENT_TYPE
    }

    pub fn belongs_to(&self, key: &SessionKey) -> bool {
        self.user_id == key.user_id && self.chat_id == key.chat_id
    }
}

/// Chat log and memory records
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Upserts the session's record: set-inserts `messages` by id and
    /// overwrites the summary
    async fn merge_messages(&self, key: &SessionKey, messages: &[Message], summary: &str)
        -> Result<()>;

    /// Summary and the last `limit` messages; `None` when the session has
    /// no durable record
    async fn recent_context(&self, key: &SessionKey, limit: usize)
        -> Result<Option<DurableContext>>;

    /// Full record of a session
    async fn chat(&self, key: &SessionKey) -> Result<Option<ChatRecord>>;

    /// Memory records of `user_id` among `mem_ids`, in request order;
    /// unknown ids are skipped
    async fn memories(&self, user_id: &str, mem_ids: &[String]) -> Result<Vec<MemoryRecord>>;

    async fn put_memory(&self, record: MemoryRecord) -> Result<()>;
}

/// Uploaded file records
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>>;

    /// Files among `file_ids` that belong to the session, are PDFs and are
    /// already vectorized
    async fn vectorized_files(&self, key: &SessionKey, file_ids: &[String])
        -> Result<Vec<FileRecord>>;

    async fn put_file(&self, record: FileRecord) -> Result<()>;

    async fn mark_vectorized(&self, file_id: &str) -> Result<()>;

    async fn mark_failed(&self, file_id: &str, error: &str) -> Result<()>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;
}
