//! Turns flowing through the in-process bus: orchestrator and synchronizer
//! consuming their topics the way `serve` runs them

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use chatrelay::buffer::{MemorySessionBuffer, SessionBuffer};
use chatrelay::bus::memory::MemoryBus;
use chatrelay::bus::payload::{DbAction, DbOp, ServerReply, Signal, UserQuery};
use chatrelay::bus::{publish_json, Subscriber};
use chatrelay::config::Config;
use chatrelay::orchestrator::{Collaborators, Orchestrator};
use chatrelay::session::{Role, SessionKey};
use chatrelay::store::ChatStore;
use chatrelay::synchronizer::Synchronizer;

use common::{replies, temp_store, wait_until, EmptySearch, ScriptedGenerator};

struct Pipeline {
    bus: Arc<MemoryBus>,
    buffer: Arc<MemorySessionBuffer>,
    store: Arc<chatrelay::store::SledStore>,
    generator: Arc<ScriptedGenerator>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Pipeline {
    fn start(with_synchronizer: bool) -> Self {
        let (dir, store) = temp_store();
        let bus = Arc::new(MemoryBus::recording(4));
        let buffer = Arc::new(MemorySessionBuffer::new());
        let generator = Arc::new(ScriptedGenerator::new(&["Hel", "lo", " there"]));
        let shutdown = CancellationToken::new();

        let orchestrator = Orchestrator::new(
            Collaborators {
                buffer: buffer.clone(),
                chats: store.clone(),
                files: store.clone(),
                search: Arc::new(EmptySearch),
                generator: generator.clone(),
                publisher: bus.clone(),
            },
            &Config::default(),
            shutdown.clone(),
        );
        spawn_consumer(&bus, "orchestrator", "user_query", Arc::new(orchestrator), &shutdown);

        if with_synchronizer {
            let synchronizer = Synchronizer::new(buffer.clone(), store.clone());
            spawn_consumer(&bus, "synchronizer", "db_ops", Arc::new(synchronizer), &shutdown);
        }

        Self {
            bus,
            buffer,
            store,
            generator,
            shutdown,
            _dir: dir,
        }
    }

    async fn send(&self, msg_id: &str, content: &str) {
        let query = UserQuery {
            msg_id: msg_id.to_string(),
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
            role: Role::User,
            content: content.to_string(),
            file_ids: Vec::new(),
            mem_ids: Vec::new(),
            timestamp: None,
        };
        publish_json(self.bus.as_ref(), "user_query", &key().token(), &query)
            .await
            .unwrap();
    }

    fn ends(&self) -> usize {
        replies(&self.bus, "server_reply")
            .iter()
            .filter(|r| matches!(r, ServerReply::Control(c) if c.signal == Signal::End))
            .count()
    }

    async fn durable_len(&self) -> usize {
        self.store
            .chat(&key())
            .await
            .unwrap()
            .map(|r| r.messages.len())
            .unwrap_or(0)
    }

    async fn buffered(&self) -> Option<usize> {
        self.buffer
            .get(&key())
            .await
            .unwrap()
            .map(|e| e.messages.len())
    }

    async fn wait_for_turns(&self, turns: usize) {
        let done = wait_until(Duration::from_secs(5), || async move { self.ends() >= turns }).await;
        assert!(done, "expected {} completed turns, saw {}", turns, self.ends());
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_consumer(
    bus: &Arc<MemoryBus>,
    component: &'static str,
    topic: &'static str,
    handler: Arc<dyn chatrelay::bus::MessageHandler>,
    shutdown: &CancellationToken,
) {
    let bus = Arc::clone(bus);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { bus.run(component, topic, handler, shutdown).await });
}

fn key() -> SessionKey {
    SessionKey::new("u1", "c1")
}

#[tokio::test]
async fn test_happy_path_turn() {
    let pipeline = Pipeline::start(false);
    pipeline.send("q1", "Hello").await;
    pipeline.wait_for_turns(1).await;

    let events = replies(&pipeline.bus, "server_reply");
    let start = match &events[0] {
        ServerReply::Control(c) if c.signal == Signal::Start => c.clone(),
        other => panic!("expected start, got {:?}", other),
    };

    let chunks: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ServerReply::Chunk(c) => Some(c),
            _ => None,
        })
        .collect();
    let indexes: Vec<u64> = chunks.iter().map(|c| c.chunk_idx).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert!(chunks.iter().all(|c| c.msg_id == start.msg_id));

    match events.last() {
        Some(ServerReply::Control(end)) => {
            assert_eq!(end.signal, Signal::End);
            assert_eq!(end.msg_id, start.msg_id);
            assert!(end.error.is_none());
        }
        other => panic!("expected end, got {:?}", other),
    }

    let entry = pipeline.buffer.get(&key()).await.unwrap().unwrap();
    assert_eq!(entry.messages.len(), 2);
    assert_eq!(entry.messages[0].role, Role::User);
    assert_eq!(entry.messages[0].content, "Hello");
    assert_eq!(entry.messages[1].role, Role::Assistant);
    assert_eq!(entry.messages[1].content, "Hello there");
    assert_eq!(entry.messages[1].msg_id, start.msg_id);

    let prompts = pipeline.generator.prompts.lock().unwrap();
    assert!(prompts[0].contains("User Query:\nHello"));
}

#[tokio::test]
async fn test_replies_keyed_by_session() {
    let pipeline = Pipeline::start(false);
    pipeline.send("q1", "Hello").await;
    pipeline.wait_for_turns(1).await;

    for message in pipeline.bus.published("server_reply") {
        assert_eq!(message.key.as_deref(), Some("u1_c1"));
    }
}

#[tokio::test]
async fn test_threshold_flush_once_per_crossing() {
    let pipeline = Pipeline::start(true);
    for i in 0..3 {
        pipeline.send(&format!("q{}", i), "next").await;
    }
    pipeline.wait_for_turns(3).await;

    let p = &pipeline;
    let flushed = wait_until(Duration::from_secs(5), || async move { p.durable_len().await == 6 }).await;
    assert!(flushed, "durable log never received the flushed messages");

    let ops: Vec<DbOp> = pipeline
        .bus
        .published("db_ops")
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].action, DbAction::Flush);

    let cleared = wait_until(Duration::from_secs(5), || async move { p.buffered().await == Some(0) }).await;
    assert!(cleared);
    let entry = pipeline.buffer.get(&key()).await.unwrap().unwrap();
    assert_eq!(entry.summary, "summary of the chat");

    let record = pipeline.store.chat(&key()).await.unwrap().unwrap();
    assert_eq!(record.summary, "summary of the chat");
}

#[tokio::test]
async fn test_turn_after_flush_keeps_summary_continuity() {
    let pipeline = Pipeline::start(true);
    for i in 0..3 {
        pipeline.send(&format!("q{}", i), "next").await;
    }
    pipeline.wait_for_turns(3).await;
    let p = &pipeline;
    let cleared = wait_until(Duration::from_secs(5), || async move { p.buffered().await == Some(0) }).await;
    assert!(cleared);

    pipeline.send("q3", "and then?").await;
    pipeline.wait_for_turns(4).await;

    let prompts = pipeline.generator.prompts.lock().unwrap();
    let last = prompts.last().unwrap();
    assert!(last.contains("Persistent Context from Summary (secondary reference):\nsummary of the chat"));
    assert_eq!(pipeline.bus.published("db_ops").len(), 1);
}
