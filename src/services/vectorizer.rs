//! File vectorization client (`POST /vectorize`, `DELETE /delete`)
//!
//! Uploads stream the file from disk as the request body; the file's
//! identity travels in headers so the body stays the raw PDF.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::{build_client, read_reply, Vectorizer};
use crate::config::VectorizerConfig;
use crate::error::{ChatRelayError, Result};
use crate::store::FileRecord;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_CHAT_ID: &str = "x-chat-id";
pub const HEADER_FILE_ID: &str = "x-file-id";
pub const HEADER_FILE_NAME: &str = "x-file-name";

/// HTTP vectorizer client
pub struct HttpVectorizer {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    #[serde(default)]
    chunk_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest<'a> {
    user_id: &'a str,
    chat_id: &'a str,
    file_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Empty {}

impl HttpVectorizer {
    pub fn new(config: &VectorizerConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Vectorizer for HttpVectorizer {
    async fn upload(&self, file: &FileRecord) -> Result<usize> {
        let handle = tokio::fs::File::open(&file.file_path).await.map_err(|e| {
            ChatRelayError::Service(format!("Cannot open {}: {}", file.file_path, e))
        })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(handle));

        tracing::debug!(file_id = %file.file_id, path = %file.file_path, "Uploading file");

        let response = self
            .client
            .post(format!("{}/vectorize", self.base_url))
            .header(HEADER_USER_ID, &file.user_id)
            .header(HEADER_CHAT_ID, &file.chat_id)
            .header(HEADER_FILE_ID, &file.file_id)
            .header(HEADER_FILE_NAME, &file.file_name)
            .header(reqwest::header::CONTENT_TYPE, &file.content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| ChatRelayError::Service(format!("Upload failed: {}", e)))?;

        let reply: UploadBody = read_reply(response, "vectorize").await?;
        if reply.chunk_count == 0 {
            return Err(ChatRelayError::Service(
                "file had no parseable documents to vectorize".to_string(),
            )
            .into());
        }
        Ok(reply.chunk_count)
    }

    async fn delete(&self, file: &FileRecord) -> Result<()> {
        let request = DeleteRequest {
            user_id: &file.user_id,
            chat_id: &file.chat_id,
            file_id: &file.file_id,
        };

        let response = self
            .client
            .delete(format!("{}/delete", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatRelayError::Service(format!("Delete failed: {}", e)))?;

        let _: Empty = read_reply(response, "delete").await?;
        Ok(())
    }
}
