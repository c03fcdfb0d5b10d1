//! Message bus contract
//!
//! The pipeline talks over four topics (`user_query`, `server_reply`,
//! `db_ops`, `vectorize_file`). Every message carries a partition key; messages
//! sharing a key are delivered in publish order to one handler at a time.
//!
//! Offsets are committed only after the handler decides:
//!
//! - `Ok(())` commits.
//! - `Err(HandlerError::Malformed)` logs the poison message and commits, so one
//!   bad payload never blocks its partition.
//! - `Err(HandlerError::Retryable)` leaves the offset uncommitted; the message
//!   is redelivered when the consumer group restarts.
//!
//! Two implementations share this contract: [`kafka`] for production and
//! [`memory`] for single-process deployments and tests.

pub mod config;
pub mod kafka;
pub mod memory;
pub mod payload;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::Result;

/// Outbound message: topic, partition key and encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encodes `value` as JSON
    pub fn json<T: Serialize>(topic: &str, key: &str, value: &T) -> Result<Self> {
        Ok(Self {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Wraps an already encoded payload, unchanged
    pub fn raw(topic: &str, key: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.into(),
        }
    }
}

/// Consumed message with its log position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Decodes the JSON payload; failure marks the message as poison
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_slice(&self.payload).map_err(HandlerError::malformed)
    }

    /// Partition key, empty when the message had none
    pub fn key_str(&self) -> &str {
        self.key.as_deref().unwrap_or("")
    }
}

/// Why a handler did not complete its unit of work
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Payload can never be processed; commit and move on
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Transient failure; leave the offset uncommitted for redelivery
    #[error("retryable failure: {0}")]
    Retryable(String),
}

impl HandlerError {
    pub fn malformed(reason: impl fmt::Display) -> Self {
        Self::Malformed(reason.to_string())
    }

    pub fn retryable(reason: impl fmt::Display) -> Self {
        Self::Retryable(reason.to_string())
    }
}

/// Publishes envelopes, returning once the broker has acknowledged
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<()>;
}

/// Encodes `value` and publishes it
pub async fn publish_json<T: Serialize + Sync>(
    publisher: &dyn Publisher,
    topic: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    publisher.publish(Envelope::json(topic, key, value)?).await
}

/// Handles one consumed message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> std::result::Result<(), HandlerError>;
}

/// Runs a consumer group member until `shutdown` fires
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Consumes `topic` as member of the group named after `component`
    ///
    /// Each partition is handled strictly in order by its own task, so a
    /// slow session only delays sessions sharing its partition.
    async fn run(
        &self,
        component: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// What to do with a message's offset after handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    Hold,
}

/// Runs the handler for one message and maps its outcome to a disposition
pub async fn deliver(handler: &dyn MessageHandler, message: &BusMessage) -> Disposition {
    let span = tracing::info_span!(
        "bus_message",
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        key = %message.key_str()
    );

    async {
        match handler.handle(message).await {
            Ok(()) => Disposition::Commit,
            Err(HandlerError::Malformed(reason)) => {
                tracing::warn!(%reason, "Discarding poison message");
                Disposition::Commit
            }
            Err(HandlerError::Retryable(reason)) => {
                tracing::error!(%reason, "Handler failed, offset left uncommitted");
                Disposition::Hold
            }
        }
    }
    .instrument(span)
    .await
}
