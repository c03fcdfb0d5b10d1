//! Clients for the retrieval-side collaborators
//!
//! Both talk JSON over HTTP to the vector service. Responses carry a
//! `success` flag and a `message`; a 2xx status with `success: false` is
//! still a failure.

pub mod vector_search;
pub mod vectorizer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChatRelayError, Result};
use crate::store::FileRecord;

pub use vector_search::HttpVectorSearch;
pub use vectorizer::HttpVectorizer;

/// One ranked document chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub page: i64,
    pub document: String,
    pub distance: f64,
}

/// Similarity search over vectorized files
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Runs every query against the given files of one session and returns
    /// up to `top_k` hits per query
    async fn query(
        &self,
        files: &[FileRecord],
        top_k: usize,
        queries: &[String],
    ) -> Result<Vec<SearchHit>>;
}

/// Document vectorization
#[async_trait]
pub trait Vectorizer: Send + Sync {
    /// Streams the file's bytes to the service; returns the chunk count
    async fn upload(&self, file: &FileRecord) -> Result<usize>;

    /// Removes every chunk of the file
    async fn delete(&self, file: &FileRecord) -> Result<()>;
}

/// Common envelope of the vector service's replies
#[derive(Debug, Deserialize)]
pub(crate) struct ServiceReply<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub body: T,
}

fn default_success() -> bool {
    true
}

/// Checks the HTTP status and the `success` flag, then decodes the body
pub(crate) async fn read_reply<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation: &str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(ChatRelayError::Service(format!(
            "{} returned {}: {}",
            operation, status, error_text
        ))
        .into());
    }

    let reply: ServiceReply<T> = response.json().await.map_err(|e| {
        ChatRelayError::Service(format!("Failed to parse {} response: {}", operation, e))
    })?;
    if !reply.success {
        return Err(
            ChatRelayError::Service(format!("{} failed: {}", operation, reply.message)).into(),
        );
    }
    Ok(reply.body)
}

pub(crate) fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ChatRelayError::Service(format!("Failed to create HTTP client: {}", e)).into())
}
