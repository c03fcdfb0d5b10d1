//! Shared fakes and helpers for the integration tests

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use chatrelay::bus::memory::MemoryBus;
use chatrelay::bus::payload::ServerReply;
use chatrelay::error::{ChatRelayError, Result};
use chatrelay::providers::{FragmentStream, Generator};
use chatrelay::services::{SearchHit, VectorSearch};
use chatrelay::session::{Message, SessionKey};
use chatrelay::store::{ChatRecord, ChatStore, DurableContext, FileRecord, MemoryRecord, SledStore};

/// Generator that streams a fixed reply and answers one-shot prompts with
/// a fixed summary
#[allow(dead_code)]
pub struct ScriptedGenerator {
    pub fragments: Vec<String>,
    pub summary: String,
    pub prompts: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl ScriptedGenerator {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            summary: "summary of the chat".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(items).boxed())
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Ok(self.summary.clone())
    }
}

/// Vector search with no results
#[allow(dead_code)]
pub struct EmptySearch;

#[async_trait]
impl VectorSearch for EmptySearch {
    async fn query(&self, _: &[FileRecord], _: usize, _: &[String]) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

/// Chat store whose merges fail while `failing` is set; everything else
/// goes to the wrapped sled store
#[allow(dead_code)]
pub struct FlakyChatStore {
    pub inner: Arc<SledStore>,
    pub failing: AtomicBool,
    pub merges: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyChatStore {
    pub fn new(inner: Arc<SledStore>, failing: bool) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(failing),
            merges: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChatStore for FlakyChatStore {
    async fn merge_messages(&self, key: &SessionKey, messages: &[Message], summary: &str) -> Result<()> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChatRelayError::Storage("durable store unreachable".to_string()).into());
        }
        self.inner.merge_messages(key, messages, summary).await
    }

    async fn recent_context(&self, key: &SessionKey, limit: usize) -> Result<Option<DurableContext>> {
        self.inner.recent_context(key, limit).await
    }

    async fn chat(&self, key: &SessionKey) -> Result<Option<ChatRecord>> {
        self.inner.chat(key).await
    }

    async fn memories(&self, user_id: &str, mem_ids: &[String]) -> Result<Vec<MemoryRecord>> {
        self.inner.memories(user_id, mem_ids).await
    }

    async fn put_memory(&self, record: MemoryRecord) -> Result<()> {
        self.inner.put_memory(record).await
    }
}

/// Opens a sled store in a fresh temporary directory
#[allow(dead_code)]
pub fn temp_store() -> (TempDir, Arc<SledStore>) {
    let dir = TempDir::new().expect("failed to create tempdir");
    let store = SledStore::open(dir.path().join("durable")).expect("failed to open store");
    (dir, Arc::new(store))
}

/// Polls `check` until it returns true or `limit` elapses
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Decoded `server_reply` events published so far
#[allow(dead_code)]
pub fn replies(bus: &MemoryBus, topic: &str) -> Vec<ServerReply> {
    bus.published(topic)
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).expect("invalid server reply"))
        .collect()
}
