//! Vector search client (`POST /query`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{build_client, read_reply, SearchHit, VectorSearch};
use crate::config::VectorSearchConfig;
use crate::error::{ChatRelayError, Result};
use crate::store::FileRecord;

/// HTTP vector search client
pub struct HttpVectorSearch {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    user_id: &'a str,
    chat_id: &'a str,
    file_ids: Vec<&'a str>,
    top_k: usize,
    query_texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl HttpVectorSearch {
    pub fn new(config: &VectorSearchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VectorSearch for HttpVectorSearch {
    async fn query(
        &self,
        files: &[FileRecord],
        top_k: usize,
        queries: &[String],
    ) -> Result<Vec<SearchHit>> {
        let Some(first) = files.first() else {
            return Ok(Vec::new());
        };

        let request = QueryRequest {
            user_id: &first.user_id,
            chat_id: &first.chat_id,
            file_ids: files.iter().map(|f| f.file_id.as_str()).collect(),
            top_k,
            query_texts: queries,
        };

        tracing::debug!(
            files = request.file_ids.len(),
            queries = queries.len(),
            top_k,
            "Querying vector search"
        );

        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatRelayError::Service(format!("Vector query failed: {}", e)))?;

        let body: QueryBody = read_reply(response, "vector query").await?;
        Ok(body.results)
    }
}
