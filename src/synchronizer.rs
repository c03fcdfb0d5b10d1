//! Durable store synchronizer
//!
//! Consumes `db_ops`. A `flush` merges the buffered messages and summary
//! into the durable chat log and then drops exactly the merged messages
//! from the buffer; the summary stays. A `del` does the same merge and
//! then removes the buffer entry. Nothing is removed from the buffer
//! unless the merge succeeded.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::Instrument;

use crate::buffer::SessionBuffer;
use crate::bus::payload::{DbAction, DbOp};
use crate::bus::{BusMessage, HandlerError, MessageHandler};
use crate::session::SessionKey;
use crate::store::ChatStore;

/// `db_ops` handler
pub struct Synchronizer {
    buffer: Arc<dyn SessionBuffer>,
    chats: Arc<dyn ChatStore>,
}

impl Synchronizer {
    pub fn new(buffer: Arc<dyn SessionBuffer>, chats: Arc<dyn ChatStore>) -> Self {
        Self { buffer, chats }
    }

    /// Merges the buffer into the durable log and truncates what was merged
    pub async fn flush(&self, key: &SessionKey) -> Result<(), HandlerError> {
        let Some(merged) = self.merge(key).await? else {
            return Ok(());
        };
        self.buffer
            .truncate_flushed(key, &merged)
            .await
            .map_err(|e| HandlerError::retryable(format!("truncate failed: {:#}", e)))?;
        tracing::info!(merged = merged.len(), "Session flushed");
        Ok(())
    }

    /// Merges the buffer, then removes the entry
    pub async fn delete(&self, key: &SessionKey) -> Result<(), HandlerError> {
        let merged = self.merge(key).await?.unwrap_or_default();
        let removed = self
            .buffer
            .delete_flushed(key, &merged)
            .await
            .map_err(|e| HandlerError::retryable(format!("delete failed: {:#}", e)))?;
        if removed {
            tracing::info!(merged = merged.len(), "Session buffer removed");
        } else {
            tracing::info!(
                merged = merged.len(),
                "Session received new messages during delete, entry kept"
            );
        }
        Ok(())
    }

    /// Returns the ids merged, or `None` when there was nothing to merge
    async fn merge(&self, key: &SessionKey) -> Result<Option<Vec<String>>, HandlerError> {
        let entry = self
            .buffer
            .get(key)
            .await
            .map_err(|e| HandlerError::retryable(format!("buffer read failed: {:#}", e)))?;
        let Some(entry) = entry.filter(|e| !e.is_empty()) else {
            tracing::debug!("Nothing buffered");
            return Ok(None);
        };

        self.chats
            .merge_messages(key, &entry.messages, &entry.summary)
            .await
            .map_err(|e| HandlerError::retryable(format!("durable merge failed: {:#}", e)))?;
        Ok(Some(entry.message_ids()))
    }
}

#[async_trait]
impl MessageHandler for Synchronizer {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandlerError> {
        let op: DbOp = message.decode()?;
        let key = op.session();
        if !key.is_valid() {
            return Err(HandlerError::malformed("db op without userId or chatId"));
        }

        let span = crate::session_span!("db_op", key, action = ?op.action);
        async {
            match op.action {
                DbAction::Flush => self.flush(&key).await,
                DbAction::Delete => self.delete(&key).await,
            }
        }
        .instrument(span)
        .await
    }
}
