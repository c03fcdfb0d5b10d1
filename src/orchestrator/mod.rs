//! Generation orchestrator
//!
//! Consumes `user_query` and drives one turn per message:
//!
//! 1. load the session context (buffer, or the durable log as fallback)
//! 2. append the user message in the background
//! 3. gather retrieved documents and memories concurrently
//! 4. stream the reply as `control start`, `chunk`* and `control end`
//! 5. append the assistant message, refresh the summary every
//!    [`SUMMARY_CADENCE`] messages and request a flush when the buffer
//!    crosses [`FLUSH_THRESHOLD`]
//!
//! A generation failure ends the turn early; the partial reply is still
//! buffered and the `end` event carries the error.

pub mod augment;
pub mod prompt;

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::buffer::SessionBuffer;
use crate::bus::payload::{ChunkEvent, ControlEvent, DbOp, ReplyRole, ServerReply, Signal, UserQuery};
use crate::bus::{publish_json, BusMessage, HandlerError, MessageHandler, Publisher};
use crate::config::{Config, TopicsConfig};
use crate::error::Result;
use crate::providers::Generator;
use crate::services::VectorSearch;
use crate::session::{new_message_id, Message, Role, SessionKey};
use crate::store::{ChatStore, FileStore};

pub use augment::{Augmentation, Augmenter};

/// Messages rendered as recent conversation in the reply prompt
pub const RECENT_WINDOW: usize = 6;
/// The summary is regenerated whenever the buffer holds a multiple of this
pub const SUMMARY_CADENCE: usize = 6;
/// Buffer size at which a flush is requested
pub const FLUSH_THRESHOLD: usize = 6;
/// Hits requested per refined query
pub const TOP_K: usize = 3;
/// Durable messages loaded when the buffer has nothing
pub const DURABLE_CONTEXT: usize = 4;

/// Shared dependencies of the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub buffer: Arc<dyn SessionBuffer>,
    pub chats: Arc<dyn ChatStore>,
    pub files: Arc<dyn FileStore>,
    pub search: Arc<dyn VectorSearch>,
    pub generator: Arc<dyn Generator>,
    pub publisher: Arc<dyn Publisher>,
}

/// Context a turn starts from
#[derive(Debug, Clone, Default)]
struct TurnContext {
    summary: String,
    messages: Vec<Message>,
    /// Buffered message count before this turn
    buffered: usize,
}

/// Result of streaming one reply
#[derive(Debug, Default)]
struct StreamOutcome {
    text: String,
    chunks: u64,
    error: Option<String>,
}

/// `user_query` handler
pub struct Orchestrator {
    buffer: Arc<dyn SessionBuffer>,
    chats: Arc<dyn ChatStore>,
    generator: Arc<dyn Generator>,
    publisher: Arc<dyn Publisher>,
    augmenter: Augmenter,
    topics: TopicsConfig,
    generation_timeout: Duration,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(deps: Collaborators, config: &Config, shutdown: CancellationToken) -> Self {
        let augmenter = Augmenter::new(
            deps.files,
            Arc::clone(&deps.chats),
            deps.search,
            Arc::clone(&deps.generator),
            Duration::from_secs(config.orchestrator.augmentation_timeout_secs),
        );

        Self {
            buffer: deps.buffer,
            chats: deps.chats,
            generator: deps.generator,
            publisher: deps.publisher,
            augmenter,
            topics: config.bus.topics.clone(),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
            shutdown,
        }
    }

    /// Runs one turn to completion
    pub async fn run_turn(&self, query: UserQuery) {
        let key = query.session();
        let context = self.load_context(&key).await;

        let mut user_message = Message::with_id(&query.msg_id, Role::User, &query.content);
        if let Some(timestamp) = &query.timestamp {
            user_message.timestamp = timestamp.clone();
        }
        let user_append = self.spawn_append(&key, user_message);

        let augmentation = self.augmenter.augment(&query).await;
        let prompt = prompt::reply_prompt(
            &prompt::PromptParts {
                recent: &context.messages,
                summary: &context.summary,
                query: &query.content,
                documents: &augmentation.documents,
                memories: &augmentation.memories,
            },
            RECENT_WINDOW,
        );

        let reply_id = new_message_id();
        self.send_control(&key, &reply_id, Signal::Start, None).await;
        let outcome = self.stream_reply(&key, &reply_id, &prompt).await;
        tracing::info!(
            reply_id = %reply_id,
            chunks = outcome.chunks,
            failed = outcome.error.is_some(),
            "Reply streamed"
        );

        match user_append.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Failed to buffer user message: {:#}", e),
            Err(e) => tracing::warn!("User message append task failed: {}", e),
        }

        if !outcome.text.is_empty() {
            let reply = Message::with_id(&reply_id, Role::Assistant, &outcome.text);
            if let Err(e) = self.buffer.append(&key, reply).await {
                tracing::error!("Failed to buffer assistant message: {:#}", e);
            }
        }

        self.after_turn(&key, context.buffered).await;
        self.send_control(&key, &reply_id, Signal::End, outcome.error).await;
    }

    /// Buffer first; the durable log when the buffer has nothing or fails
    async fn load_context(&self, key: &SessionKey) -> TurnContext {
        match self.buffer.get(key).await {
            Ok(Some(entry)) if !entry.is_empty() => {
                return TurnContext {
                    buffered: entry.messages.len(),
                    summary: entry.summary,
                    messages: entry.messages,
                };
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Session buffer unavailable, using durable log: {:#}", e),
        }

        match self.chats.recent_context(key, DURABLE_CONTEXT).await {
            Ok(Some(durable)) => {
                if !durable.summary.is_empty() {
                    if let Err(e) = self.buffer.set_summary(key, &durable.summary).await {
                        tracing::warn!("Failed to seed buffer summary: {:#}", e);
                    }
                }
                TurnContext {
                    summary: durable.summary,
                    messages: durable.messages,
                    buffered: 0,
                }
            }
            Ok(None) => TurnContext::default(),
            Err(e) => {
                tracing::warn!("Durable context unavailable, continuing without: {:#}", e);
                TurnContext::default()
            }
        }
    }

    fn spawn_append(&self, key: &SessionKey, message: Message) -> JoinHandle<Result<usize>> {
        let buffer = Arc::clone(&self.buffer);
        let key = key.clone();
        tokio::spawn(
            async move { buffer.append(&key, message).await }.instrument(tracing::Span::current()),
        )
    }

    async fn stream_reply(&self, key: &SessionKey, reply_id: &str, prompt: &str) -> StreamOutcome {
        let mut outcome = StreamOutcome::default();
        let deadline = Instant::now() + self.generation_timeout;
        let cancel = self.shutdown.child_token();

        let mut stream =
            match tokio::time::timeout_at(deadline, self.generator.generate_stream(prompt)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::error!("Generation failed to start: {:#}", e);
                    outcome.error = Some(format!("generation failed: {}", e));
                    return outcome;
                }
                Err(_) => {
                    outcome.error = Some("generation timed out".to_string());
                    return outcome;
                }
            };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.error.get_or_insert_with(|| "generation cancelled".to_string());
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("Generation exceeded {:?}", self.generation_timeout);
                    outcome.error = Some("generation timed out".to_string());
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                None => break,
                Some(Err(e)) => {
                    tracing::error!("Generation stream failed: {:#}", e);
                    outcome.error = Some(format!("generation failed: {}", e));
                    break;
                }
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    outcome.text.push_str(&fragment);

                    let chunk = ServerReply::Chunk(ChunkEvent {
                        msg_id: reply_id.to_string(),
                        chat_id: key.chat_id.clone(),
                        user_id: key.user_id.clone(),
                        role: ReplyRole::Ai,
                        content: fragment,
                        chunk_idx: outcome.chunks,
                    });
                    if let Err(e) = self.reply(key, &chunk).await {
                        tracing::error!(chunk_idx = outcome.chunks, "Failed to publish chunk: {:#}", e);
                        outcome.error = Some(format!("reply delivery failed: {}", e));
                        cancel.cancel();
                        continue;
                    }
                    outcome.chunks += 1;
                }
            }
        }

        outcome
    }

    /// Summary refresh and flush trigger, based on the buffer after this turn
    async fn after_turn(&self, key: &SessionKey, before: usize) {
        let entry = match self.buffer.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Cannot re-read session buffer: {:#}", e);
                return;
            }
        };
        let after = entry.messages.len();

        if after > 0 && after % SUMMARY_CADENCE == 0 {
            self.refresh_summary(key, &entry.summary, entry.recent(RECENT_WINDOW))
                .await;
        }

        if crosses_threshold(before, after) {
            tracing::info!(buffered = after, "Requesting flush");
            if let Err(e) = publish_json(
                self.publisher.as_ref(),
                &self.topics.db_ops,
                &key.token(),
                &DbOp::flush(key),
            )
            .await
            {
                tracing::error!("Failed to publish flush request: {:#}", e);
            }
        }
    }

    async fn refresh_summary(&self, key: &SessionKey, previous: &str, recent: &[Message]) {
        let request = prompt::summary_prompt(previous, recent, RECENT_WINDOW);
        match self.generator.generate(&request).await {
            Ok(summary) => {
                let summary = summary.trim();
                if let Err(e) = self.buffer.set_summary(key, summary).await {
                    tracing::warn!("Failed to store summary: {:#}", e);
                } else {
                    tracing::debug!(len = summary.len(), "Summary refreshed");
                }
            }
            Err(e) => tracing::warn!("Summarization failed, keeping previous summary: {:#}", e),
        }
    }

    async fn send_control(
        &self,
        key: &SessionKey,
        reply_id: &str,
        signal: Signal,
        error: Option<String>,
    ) {
        let event = ServerReply::Control(ControlEvent {
            msg_id: reply_id.to_string(),
            chat_id: key.chat_id.clone(),
            user_id: key.user_id.clone(),
            role: ReplyRole::Ai,
            signal,
            error,
        });
        if let Err(e) = self.reply(key, &event).await {
            tracing::error!(?signal, "Failed to publish control event: {:#}", e);
        }
    }

    async fn reply(&self, key: &SessionKey, event: &ServerReply) -> Result<()> {
        publish_json(
            self.publisher.as_ref(),
            &self.topics.server_reply,
            &key.token(),
            event,
        )
        .await
    }
}

/// True when growing from `before` to `after` messages crosses a multiple
/// of [`FLUSH_THRESHOLD`]
pub fn crosses_threshold(before: usize, after: usize) -> bool {
    after >= FLUSH_THRESHOLD && before / FLUSH_THRESHOLD < after / FLUSH_THRESHOLD
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, message: &BusMessage) -> std::result::Result<(), HandlerError> {
        let query: UserQuery = message.decode()?;
        if query.msg_id.is_empty() || !query.session().is_valid() {
            return Err(HandlerError::malformed("user query without msgId, userId or chatId"));
        }

        let key = query.session();
        let span = crate::session_span!("turn", key, msg_id = %query.msg_id);
        self.run_turn(query).instrument(span).await;
        Ok(())
    }
}
