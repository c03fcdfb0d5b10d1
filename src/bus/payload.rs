//! Wire payloads of the four pipeline topics
//!
//! All payloads are JSON. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::session::{Role, SessionKey};

/// One user turn as published by the hub on `user_query`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    /// Id of the user message
    pub msg_id: String,
    /// Chat the turn belongs to
    pub chat_id: String,
    /// Author of the turn
    pub user_id: String,
    /// Always `user` for inbound turns
    #[serde(default = "default_user_role")]
    pub role: Role,
    /// Message text
    pub content: String,
    /// Files to retrieve context from
    #[serde(default)]
    pub file_ids: Vec<String>,
    /// Memory records to include
    #[serde(default)]
    pub mem_ids: Vec<String>,
    /// Client timestamp, if supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn default_user_role() -> Role {
    Role::User
}

impl UserQuery {
    /// Session the turn belongs to
    pub fn session(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.chat_id)
    }
}

/// Role marker carried by every reply event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyRole {
    /// Generated text
    #[default]
    #[serde(rename = "ai")]
    Ai,
}

/// Turn boundary signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Generation is about to stream
    Start,
    /// No further chunks follow for this turn
    End,
}

/// Start or end of one assistant turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEvent {
    /// Id of the assistant message being produced
    pub msg_id: String,
    pub chat_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role: ReplyRole,
    pub signal: Signal,
    /// Set on `end` when the turn was cut short by a generation failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One generated fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEvent {
    /// Id of the assistant message being produced
    pub msg_id: String,
    pub chat_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role: ReplyRole,
    pub content: String,
    /// Zero-based, gapless within one turn
    pub chunk_idx: u64,
}

/// Outcome of a file task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// File was vectorized
    Success,
    /// File was removed
    Deleted,
    /// Task failed; `error` says why
    Error,
}

/// Status of a vectorize or delete task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatusEvent {
    pub file_id: String,
    pub file_name: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every event published on `server_reply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Control(ControlEvent),
    Chunk(ChunkEvent),
    VectorizationStatus(FileStatusEvent),
    DeletionStatus(FileStatusEvent),
}

impl ServerReply {
    /// Value of the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Control(_) => "control",
            Self::Chunk(_) => "chunk",
            Self::VectorizationStatus(_) => "vectorization_status",
            Self::DeletionStatus(_) => "deletion_status",
        }
    }
}

/// Action requested on `db_ops`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbAction {
    /// Merge buffered messages into the durable log, keep the summary
    #[serde(rename = "flush")]
    Flush,
    /// Merge, then drop the buffer entry
    #[serde(rename = "del", alias = "delete")]
    Delete,
}

/// Flush or delete request for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbOp {
    pub user_id: String,
    pub chat_id: String,
    pub action: DbAction,
}

impl DbOp {
    pub fn flush(key: &SessionKey) -> Self {
        Self::new(key, DbAction::Flush)
    }

    pub fn delete(key: &SessionKey) -> Self {
        Self::new(key, DbAction::Delete)
    }

    fn new(key: &SessionKey, action: DbAction) -> Self {
        Self {
            user_id: key.user_id.clone(),
            chat_id: key.chat_id.clone(),
            action,
        }
    }

    /// Session the request targets
    pub fn session(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.chat_id)
    }
}

/// File identity carried by a vectorization task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTask {
    pub user_id: String,
    pub chat_id: String,
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
}

impl FileTask {
    pub fn session(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.chat_id)
    }
}

/// Task published on `vectorize_file`, keyed by chat id
///
/// Unknown `operation` values fail to decode and are discarded as poison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum VectorizeTask {
    Vectorize(FileTask),
    Delete(FileTask),
}

impl VectorizeTask {
    pub fn file(&self) -> &FileTask {
        match self {
            Self::Vectorize(task) | Self::Delete(task) => task,
        }
    }
}
