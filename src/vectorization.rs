//! Vectorization task worker
//!
//! Consumes `vectorize_file`. Every task ends with a status event on
//! `server_reply` keyed by the owning session, so the client learns the
//! outcome even when the file could not be processed.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::Instrument;

use crate::bus::payload::{FileStatus, FileStatusEvent, FileTask, ServerReply, VectorizeTask};
use crate::bus::{publish_json, BusMessage, HandlerError, MessageHandler, Publisher};
use crate::services::Vectorizer;
use crate::store::{FileRecord, FileStore};

/// `vectorize_file` handler
pub struct VectorizationWorker {
    files: Arc<dyn FileStore>,
    vectorizer: Arc<dyn Vectorizer>,
    publisher: Arc<dyn Publisher>,
    reply_topic: String,
}

impl VectorizationWorker {
    pub fn new(
        files: Arc<dyn FileStore>,
        vectorizer: Arc<dyn Vectorizer>,
        publisher: Arc<dyn Publisher>,
        reply_topic: impl Into<String>,
    ) -> Self {
        Self {
            files,
            vectorizer,
            publisher,
            reply_topic: reply_topic.into(),
        }
    }

    /// Uploads the file and records the outcome
    pub async fn vectorize(&self, task: &FileTask) -> Result<(), HandlerError> {
        let record = match self.files.get_file(&task.file_id).await {
            Ok(record) => record,
            Err(e) => {
                self.status_vectorize(task, FileStatus::Error, Some("file lookup failed".to_string()))
                    .await;
                return Err(HandlerError::retryable(format!("file lookup failed: {:#}", e)));
            }
        };

        let record = match check_vectorizable(task, record) {
            Ok(record) => record,
            Err(reason) => {
                tracing::warn!(%reason, "Rejecting vectorize task");
                self.status_vectorize(task, FileStatus::Error, Some(reason)).await;
                return Ok(());
            }
        };

        match self.vectorizer.upload(&record).await {
            Ok(chunks) => {
                self.files
                    .mark_vectorized(&record.file_id)
                    .await
                    .map_err(|e| HandlerError::retryable(format!("mark vectorized failed: {:#}", e)))?;
                tracing::info!(chunks, "File vectorized");
                self.status_vectorize(task, FileStatus::Success, None).await;
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::error!(%reason, "Vectorization failed");
                if let Err(e) = self.files.mark_failed(&record.file_id, &reason).await {
                    tracing::warn!("Failed to record vectorization error: {:#}", e);
                }
                self.status_vectorize(task, FileStatus::Error, Some(reason)).await;
            }
        }
        Ok(())
    }

    /// Removes the file's chunks (when it has any) and its record
    pub async fn delete(&self, task: &FileTask) -> Result<(), HandlerError> {
        let record = match self.files.get_file(&task.file_id).await {
            Ok(record) => record,
            Err(e) => {
                self.status_delete(task, FileStatus::Error, Some("file lookup failed".to_string()))
                    .await;
                return Err(HandlerError::retryable(format!("file lookup failed: {:#}", e)));
            }
        };

        let Some(record) = record else {
            tracing::debug!("File record already gone");
            self.status_delete(task, FileStatus::Deleted, None).await;
            return Ok(());
        };

        if !record.belongs_to(&task.session()) {
            tracing::warn!("Rejecting delete task for a file of another chat");
            self.status_delete(
                task,
                FileStatus::Error,
                Some("file does not belong to this chat".to_string()),
            )
            .await;
            return Ok(());
        }

        let mut failure = None;
        if record.vectorized {
            if let Err(e) = self.vectorizer.delete(&record).await {
                let reason = format!("{:#}", e);
                tracing::error!(%reason, "Vector deletion failed");
                failure = Some(reason);
            }
        }

        self.files
            .delete_file(&record.file_id)
            .await
            .map_err(|e| HandlerError::retryable(format!("record removal failed: {:#}", e)))?;

        match failure {
            None => self.status_delete(task, FileStatus::Deleted, None).await,
            Some(reason) => self.status_delete(task, FileStatus::Error, Some(reason)).await,
        }
        Ok(())
    }

    async fn status_vectorize(&self, task: &FileTask, status: FileStatus, error: Option<String>) {
        let event = ServerReply::VectorizationStatus(status_event(task, status, error));
        self.publish_status(task, &event).await;
    }

    async fn status_delete(&self, task: &FileTask, status: FileStatus, error: Option<String>) {
        let event = ServerReply::DeletionStatus(status_event(task, status, error));
        self.publish_status(task, &event).await;
    }

    async fn publish_status(&self, task: &FileTask, event: &ServerReply) {
        let key = task.session().token();
        if let Err(e) = publish_json(self.publisher.as_ref(), &self.reply_topic, &key, event).await {
            tracing::error!(kind = event.kind(), "Failed to publish file status: {:#}", e);
        }
    }
}

fn status_event(task: &FileTask, status: FileStatus, error: Option<String>) -> FileStatusEvent {
    FileStatusEvent {
        file_id: task.file_id.clone(),
        file_name: task.file_name.clone(),
        status,
        error,
    }
}

/// The record must exist, belong to the task's session, be a PDF and not
/// be vectorized yet
fn check_vectorizable(task: &FileTask, record: Option<FileRecord>) -> Result<FileRecord, String> {
    let record = record.ok_or_else(|| "file not found".to_string())?;
    if !record.belongs_to(&task.session()) {
        return Err("file does not belong to this chat".to_string());
    }
    if !record.is_pdf() {
        return Err(format!("unsupported file type: {}", record.content_type));
    }
    if record.vectorized {
        return Err("file already vectorized".to_string());
    }
    Ok(record)
}

#[async_trait]
impl MessageHandler for VectorizationWorker {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandlerError> {
        let task: VectorizeTask = message.decode()?;
        let file = task.file();
        if file.file_id.is_empty() || !file.session().is_valid() {
            return Err(HandlerError::malformed("file task without fileId, userId or chatId"));
        }

        let key = file.session();
        let span = crate::session_span!("file_task", key, file_id = %file.file_id);
        async {
            match &task {
                VectorizeTask::Vectorize(file) => self.vectorize(file).await,
                VectorizeTask::Delete(file) => self.delete(file).await,
            }
        }
        .instrument(span)
        .await
    }
}
