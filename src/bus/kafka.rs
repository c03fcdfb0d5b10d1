//! Kafka bus implementation on rdkafka.
//!
//! The producer waits for full acknowledgement of every publish. The
//! consumer disables auto commit, detaches each message from the client and
//! routes it to a worker task owned by its partition; the worker runs the
//! handler and commits `offset + 1` when the handler allows it. A held
//! message makes the worker seek back to it after the retry backoff and
//! discard whatever was already fetched behind it.

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::KafkaSettings;
use super::{deliver, BusMessage, Disposition, Envelope, MessageHandler, Publisher, Subscriber};
use crate::error::{ChatRelayError, Result};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const PARTITION_QUEUE_DEPTH: usize = 1024;
const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared producer for every topic
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    /// Creates the producer.
    ///
    /// # Errors
    ///
    /// Returns `ChatRelayError::Bus` if librdkafka rejects the configuration.
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        tracing::info!(
            brokers = %settings.brokers,
            security_protocol = %settings.security.protocol.as_str(),
            "Creating Kafka producer"
        );
        let producer: FutureProducer = settings
            .producer_config()
            .create()
            .map_err(|e| ChatRelayError::Bus(format!("Failed to create producer: {}", e)))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let record = FutureRecord::to(&envelope.topic)
            .key(&envelope.key)
            .payload(&envelope.payload);

        match self.producer.send(record, DELIVERY_TIMEOUT).await {
            Ok((partition, offset)) => {
                tracing::trace!(topic = %envelope.topic, partition, offset, "Published");
                Ok(())
            }
            Err((e, _)) => Err(ChatRelayError::Bus(format!(
                "Failed to publish to {}: {}",
                envelope.topic, e
            ))
            .into()),
        }
    }
}

/// Consumer group member factory
pub struct KafkaSubscriber {
    settings: KafkaSettings,
}

impl KafkaSubscriber {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    async fn run(
        &self,
        component: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let group_id = self.settings.group_id(component);
        tracing::info!(
            brokers = %self.settings.brokers,
            topic,
            group_id = %group_id,
            "Starting Kafka consumer"
        );

        let consumer: StreamConsumer = self
            .settings
            .consumer_config(component)
            .create()
            .map_err(|e| ChatRelayError::Bus(format!("Failed to create consumer: {}", e)))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| ChatRelayError::Bus(format!("Failed to subscribe to {}: {}", topic, e)))?;
        let consumer = Arc::new(consumer);

        let mut workers: HashMap<i32, mpsc::Sender<OwnedMessage>> = HashMap::new();
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = consumer.recv() => received,
            };

            let message = match received {
                Ok(borrowed) => borrowed.detach(),
                Err(e) => {
                    tracing::warn!(topic, error = %e, "Kafka receive error");
                    continue;
                }
            };

            let partition = message.partition();
            let sender = workers.entry(partition).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(PARTITION_QUEUE_DEPTH);
                tasks.spawn(partition_worker(
                    Arc::clone(&consumer),
                    rx,
                    Arc::clone(&handler),
                    self.settings.retry_backoff,
                ));
                tx
            });

            if sender.send(message).await.is_err() {
                tracing::error!(topic, partition, "Partition worker exited; message left uncommitted");
                workers.remove(&partition);
            }
        }

        // Closing the queues lets each worker finish what it already holds.
        drop(workers);
        while tasks.join_next().await.is_some() {}

        tracing::info!(topic, group_id = %group_id, "Kafka consumer stopped");
        Ok(())
    }
}

async fn partition_worker(
    consumer: Arc<StreamConsumer>,
    mut queue: mpsc::Receiver<OwnedMessage>,
    handler: Arc<dyn MessageHandler>,
    retry_backoff: Duration,
) {
    let mut rewind = Rewind::default();

    while let Some(message) = queue.recv().await {
        if rewind.skips(message.offset()) {
            continue;
        }

        let bus_message = to_bus_message(&message);
        match deliver(handler.as_ref(), &bus_message).await {
            Disposition::Hold => {
                tokio::time::sleep(retry_backoff).await;
                rewind.hold(&consumer, &bus_message);
            }
            Disposition::Commit if rewind.stuck => {}
            Disposition::Commit => {
                if let Err(e) = commit(&consumer, &bus_message) {
                    tracing::warn!(
                        topic = %bus_message.topic,
                        partition = bus_message.partition,
                        offset = bus_message.offset,
                        error = %e,
                        "Offset commit failed"
                    );
                }
            }
        }
    }
}

/// Redelivery state of one partition worker
#[derive(Debug, Default)]
struct Rewind {
    /// Offset the consumer was sent back to; fetched messages are dropped
    /// until it arrives again
    awaiting: Option<i64>,
    /// The seek failed, so nothing more may be committed until a rebalance
    /// or restart replays the held message
    stuck: bool,
}

impl Rewind {
    fn skips(&mut self, offset: i64) -> bool {
        match self.awaiting {
            Some(target) if offset != target => true,
            Some(_) => {
                self.awaiting = None;
                false
            }
            None => false,
        }
    }

    fn hold(&mut self, consumer: &StreamConsumer, message: &BusMessage) {
        match consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            SEEK_TIMEOUT,
        ) {
            Ok(()) => {
                tracing::debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Rewound to held message"
                );
                self.awaiting = Some(message.offset);
            }
            Err(e) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Seek to held message failed; partition left uncommitted"
                );
                self.stuck = true;
            }
        }
    }
}

fn to_bus_message(message: &OwnedMessage) -> BusMessage {
    BusMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

fn commit(consumer: &StreamConsumer, message: &BusMessage) -> Result<()> {
    let mut offsets = TopicPartitionList::new();
    offsets
        .add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| ChatRelayError::Bus(e.to_string()))?;
    consumer
        .commit(&offsets, CommitMode::Async)
        .map_err(|e| ChatRelayError::Bus(e.to_string()))?;
    Ok(())
}
