//! Retrieval and memory augmentation
//!
//! Both lookups run concurrently under their own timeout. A failure or a
//! timeout degrades to an empty section; it never fails the turn.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::payload::UserQuery;
use crate::error::{ChatRelayError, Result};
use crate::providers::Generator;
use crate::services::VectorSearch;
use crate::store::{ChatStore, FileStore};

use super::prompt::{format_hits, format_memories, parse_refinement, refine_prompt};
use super::TOP_K;

/// Rendered augmentation sections of one prompt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Augmentation {
    pub documents: String,
    pub memories: String,
}

/// Gathers retrieved documents and memory entries for a turn
pub struct Augmenter {
    files: Arc<dyn FileStore>,
    chats: Arc<dyn ChatStore>,
    search: Arc<dyn VectorSearch>,
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl Augmenter {
    pub fn new(
        files: Arc<dyn FileStore>,
        chats: Arc<dyn ChatStore>,
        search: Arc<dyn VectorSearch>,
        generator: Arc<dyn Generator>,
        timeout: Duration,
    ) -> Self {
        Self {
            files,
            chats,
            search,
            generator,
            timeout,
        }
    }

    /// Runs both lookups concurrently
    pub async fn augment(&self, query: &UserQuery) -> Augmentation {
        let (documents, memories) = tokio::join!(
            bounded("retrieval", self.timeout, self.retrieve(query)),
            bounded("memories", self.timeout, self.memories(query)),
        );
        Augmentation {
            documents,
            memories,
        }
    }

    /// Refines the query into sub-queries and searches the session's
    /// vectorized files
    pub async fn retrieve(&self, query: &UserQuery) -> Result<String> {
        if query.file_ids.is_empty() {
            return Ok(String::new());
        }

        let files = self
            .files
            .vectorized_files(&query.session(), &query.file_ids)
            .await?;
        if files.is_empty() {
            tracing::debug!(
                requested = query.file_ids.len(),
                "No vectorized files among requested ids"
            );
            return Ok(String::new());
        }

        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        let refined = self
            .generator
            .generate(&refine_prompt(&query.content, &names))
            .await?;
        let queries = parse_refinement(&refined);
        if queries.is_empty() {
            return Err(ChatRelayError::Provider("Query refinement returned nothing".to_string()).into());
        }
        tracing::debug!(queries = ?queries, "Refined retrieval queries");

        let hits = self.search.query(&files, TOP_K, &queries).await?;
        Ok(format_hits(&hits))
    }

    /// Loads the requested memory records
    pub async fn memories(&self, query: &UserQuery) -> Result<String> {
        if query.mem_ids.is_empty() {
            return Ok(String::new());
        }
        let records = self.chats.memories(&query.user_id, &query.mem_ids).await?;
        Ok(format_memories(&records))
    }
}

async fn bounded<F>(what: &str, limit: Duration, lookup: F) -> String
where
    F: Future<Output = Result<String>>,
{
    match tokio::time::timeout(limit, lookup).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!("Augmentation step {} failed: {:#}", what, e);
            String::new()
        }
        Err(_) => {
            tracing::warn!("Augmentation step {} timed out after {:?}", what, limit);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FragmentStream;
    use crate::services::SearchHit;
    use crate::store::sled::SledStore;
    use crate::store::{FileRecord, MemoryRecord, PDF_CONTENT_TYPE};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Refiner(String);

    #[async_trait]
    impl Generator for Refiner {
        async fn generate_stream(&self, _prompt: &str) -> Result<FragmentStream> {
            Err(ChatRelayError::Provider("not used".to_string()).into())
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSearch {
        calls: Mutex<Vec<(Vec<String>, usize, Vec<String>)>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl VectorSearch for RecordingSearch {
        async fn query(
            &self,
            files: &[FileRecord],
            top_k: usize,
            queries: &[String],
        ) -> Result<Vec<SearchHit>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push((
                files.iter().map(|f| f.file_id.clone()).collect(),
                top_k,
                queries.to_vec(),
            ));
            Ok(vec![SearchHit {
                id: "h1".to_string(),
                source: "guide.pdf".to_string(),
                page: 4,
                document: "the answer".to_string(),
                distance: 0.25,
            }])
        }
    }

    fn query(file_ids: &[&str], mem_ids: &[&str]) -> UserQuery {
        UserQuery {
            msg_id: "q1".to_string(),
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
            role: crate::session::Role::User,
            content: "what does the guide say".to_string(),
            file_ids: file_ids.iter().map(|s| s.to_string()).collect(),
            mem_ids: mem_ids.iter().map(|s| s.to_string()).collect(),
            timestamp: None,
        }
    }

    async fn store_with_file(dir: &TempDir, vectorized: bool) -> Arc<SledStore> {
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        store
            .put_file(FileRecord {
                file_id: "f1".to_string(),
                user_id: "u1".to_string(),
                chat_id: "c1".to_string(),
                file_name: "guide.pdf".to_string(),
                file_path: "/tmp/guide.pdf".to_string(),
                content_type: PDF_CONTENT_TYPE.to_string(),
                vectorized,
                error: None,
            })
            .await
            .unwrap();
        store
            .put_memory(MemoryRecord {
                mem_id: "m1".to_string(),
                user_id: "u1".to_string(),
                context: "likes short answers".to_string(),
            })
            .await
            .unwrap();
        store
    }

    fn augmenter(
        store: Arc<SledStore>,
        search: Arc<RecordingSearch>,
        refined: &str,
        timeout: Duration,
    ) -> Augmenter {
        Augmenter::new(
            store.clone(),
            store,
            search,
            Arc::new(Refiner(refined.to_string())),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_augment_with_files_and_memories() {
        let dir = TempDir::new().unwrap();
        let store = store_with_file(&dir, true).await;
        let search = Arc::new(RecordingSearch::default());
        let augmenter = augmenter(store, search.clone(), "a, b ,c", Duration::from_secs(5));

        let result = augmenter.augment(&query(&["f1"], &["m1"])).await;

        assert!(result.documents.contains("Source: guide.pdf (Page 4)"));
        assert_eq!(result.memories, "m1: likes short answers\n");
        let calls = search.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec!["f1"]);
        assert_eq!(calls[0].1, TOP_K);
        assert_eq!(calls[0].2, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unvectorized_files_skip_search() {
        let dir = TempDir::new().unwrap();
        let store = store_with_file(&dir, false).await;
        let search = Arc::new(RecordingSearch::default());
        let augmenter = augmenter(store, search.clone(), "a,b,c", Duration::from_secs(5));

        let result = augmenter.augment(&query(&["f1"], &[])).await;

        assert_eq!(result, Augmentation::default());
        assert!(search.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_refinement_degrades() {
        let dir = TempDir::new().unwrap();
        let store = store_with_file(&dir, true).await;
        let search = Arc::new(RecordingSearch::default());
        let augmenter = augmenter(store, search.clone(), " , ", Duration::from_secs(5));

        let result = augmenter.augment(&query(&["f1"], &["m1"])).await;

        assert!(result.documents.is_empty());
        assert_eq!(result.memories, "m1: likes short answers\n");
        assert!(search.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_search_times_out_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_with_file(&dir, true).await;
        let search = Arc::new(RecordingSearch {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let augmenter = augmenter(store, search, "a,b,c", Duration::from_millis(50));

        let result = augmenter.augment(&query(&["f1"], &["m1"])).await;

        assert!(result.documents.is_empty());
        assert_eq!(result.memories, "m1: likes short answers\n");
    }
}
