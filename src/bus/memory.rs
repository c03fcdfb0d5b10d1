//! In-process partitioned bus
//!
//! Mirrors the Kafka contract inside one process: a fixed number of
//! partitions per topic, keys hashed onto partitions, one ordered worker per
//! partition and per-group committed offsets. A held message stops its
//! partition: after the retry backoff the worker rewinds to the committed
//! offset and delivers it again, and nothing behind it runs first.
//!
//! Entries below the lowest offset committed by every group that has
//! consumed a partition are dropped. Offsets keep counting from where they
//! were, and a group that subscribes later starts at the oldest retained
//! entry.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{deliver, BusMessage, Disposition, Envelope, MessageHandler, Publisher, Subscriber};
use crate::error::{ChatRelayError, Result};

/// Retained tail of one partition
#[derive(Default)]
struct PartitionLog {
    /// Offset of the first retained entry
    base: i64,
    entries: VecDeque<BusMessage>,
}

impl PartitionLog {
    fn next_offset(&self) -> i64 {
        self.base + self.entries.len() as i64
    }

    fn trim_below(&mut self, offset: i64) {
        while self.base < offset && self.entries.pop_front().is_some() {
            self.base += 1;
        }
    }
}

/// Committed positions of every group that has consumed a partition
#[derive(Default)]
struct GroupOffsets {
    members: HashSet<String>,
    committed: HashMap<String, i64>,
}

impl GroupOffsets {
    /// Lowest committed offset across members; `None` while any member has
    /// yet to commit
    fn low_water(&self) -> Option<i64> {
        self.members
            .iter()
            .map(|group| self.committed.get(group).copied())
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }
}

#[derive(Default)]
struct Partition {
    log: Mutex<PartitionLog>,
    offsets: Mutex<GroupOffsets>,
    appended: Notify,
    /// Keep consumed entries so `published` can still report them
    keep_consumed: bool,
}

impl Partition {
    fn new(keep_consumed: bool) -> Self {
        Self {
            keep_consumed,
            ..Default::default()
        }
    }

    /// Entry at `offset`, or the oldest retained entry when `offset` has
    /// already been trimmed
    fn read(&self, offset: i64) -> Result<Option<BusMessage>> {
        let log = self
            .log
            .lock()
            .map_err(|_| ChatRelayError::Bus("partition log lock poisoned".to_string()))?;
        let idx = usize::try_from(offset.saturating_sub(log.base)).unwrap_or(0);
        Ok(log.entries.get(idx).cloned())
    }

    fn offsets(&self) -> Result<MutexGuard<'_, GroupOffsets>> {
        self.offsets
            .lock()
            .map_err(|_| ChatRelayError::Bus("offset table lock poisoned".to_string()).into())
    }

    /// Registers `group` as a consumer and returns where it resumes
    fn join(&self, group: &str) -> Result<i64> {
        let mut offsets = self.offsets()?;
        offsets.members.insert(group.to_string());
        Ok(offsets.committed.get(group).copied().unwrap_or(0))
    }

    fn committed(&self, group: &str) -> Result<Option<i64>> {
        Ok(self.offsets()?.committed.get(group).copied())
    }

    fn commit(&self, group: &str, next_offset: i64) -> Result<()> {
        let low_water = {
            let mut offsets = self.offsets()?;
            offsets.committed.insert(group.to_string(), next_offset);
            offsets.low_water()
        };

        if let Some(low_water) = low_water.filter(|_| !self.keep_consumed) {
            self.log
                .lock()
                .map_err(|_| ChatRelayError::Bus("partition log lock poisoned".to_string()))?
                .trim_below(low_water);
        }
        Ok(())
    }

    fn retained(&self) -> usize {
        self.log.lock().map(|l| l.entries.len()).unwrap_or(0)
    }
}

struct TopicLog {
    partitions: Vec<Arc<Partition>>,
}

/// In-process bus shared by every component of one process
pub struct MemoryBus {
    partition_count: usize,
    keep_consumed: bool,
    retry_backoff: Duration,
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
}

impl MemoryBus {
    /// Creates a bus with `partition_count` partitions per topic (minimum 1)
    pub fn new(partition_count: usize) -> Self {
        Self {
            partition_count: partition_count.max(1),
            keep_consumed: false,
            retry_backoff: Duration::from_secs(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the delay before a held message is delivered again
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Creates a bus that never drops consumed entries, so everything ever
    /// published stays visible through [`MemoryBus::published`]
    pub fn recording(partition_count: usize) -> Self {
        Self {
            keep_consumed: true,
            ..Self::new(partition_count)
        }
    }

    /// Partition a key maps to
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partition_count as u64) as i32
    }

    fn topic(&self, name: &str) -> Result<Arc<TopicLog>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| ChatRelayError::Bus("topic table lock poisoned".to_string()))?;
        let log = topics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(TopicLog {
                partitions: (0..self.partition_count)
                    .map(|_| Arc::new(Partition::new(self.keep_consumed)))
                    .collect(),
            })
        });
        Ok(Arc::clone(log))
    }

    /// Retained messages on `topic`, ordered by partition then offset
    ///
    /// On a bus built with [`MemoryBus::recording`] this is every message
    /// ever published.
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        let Ok(log) = self.topic(topic) else {
            return Vec::new();
        };
        log.partitions
            .iter()
            .filter_map(|p| p.log.lock().ok().map(|l| l.entries.iter().cloned().collect::<Vec<_>>()))
            .flatten()
            .collect()
    }

    /// Number of entries still held in memory for `topic`
    pub fn retained(&self, topic: &str) -> usize {
        self.topic(topic)
            .map(|log| log.partitions.iter().map(|p| p.retained()).sum())
            .unwrap_or(0)
    }

    /// Next offset the group will read from `partition` of `topic`
    pub fn committed(&self, component: &str, topic: &str, partition: i32) -> Option<i64> {
        let log = self.topic(topic).ok()?;
        let partition = log.partitions.get(usize::try_from(partition).ok()?)?;
        partition.committed(component).ok().flatten()
    }

    fn append(&self, envelope: Envelope) -> Result<BusMessage> {
        let log = self.topic(&envelope.topic)?;
        let partition_id = self.partition_for(&envelope.key);
        let partition = &log.partitions[partition_id as usize];

        let message = {
            let mut tail = partition
                .log
                .lock()
                .map_err(|_| ChatRelayError::Bus("partition log lock poisoned".to_string()))?;
            let message = BusMessage {
                topic: envelope.topic,
                partition: partition_id,
                offset: tail.next_offset(),
                key: Some(envelope.key),
                payload: envelope.payload,
            };
            tail.entries.push_back(message.clone());
            message
        };

        partition.appended.notify_waiters();
        Ok(message)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let message = self.append(envelope)?;
        tracing::trace!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Published"
        );
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBus {
    async fn run(
        &self,
        component: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let log = self.topic(topic)?;
        tracing::info!(
            component,
            topic,
            partitions = log.partitions.len(),
            "Starting in-memory consumer"
        );

        let mut workers = tokio::task::JoinSet::new();
        for partition in &log.partitions {
            workers.spawn(partition_worker(
                component.to_string(),
                Arc::clone(partition),
                Arc::clone(&handler),
                self.retry_backoff,
                shutdown.clone(),
            ));
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(component, topic, error = %e, "Partition worker failed"),
                Err(e) => tracing::error!(component, topic, error = %e, "Partition worker panicked"),
            }
        }

        tracing::info!(component, topic, "In-memory consumer stopped");
        Ok(())
    }
}

async fn partition_worker(
    group: String,
    partition: Arc<Partition>,
    handler: Arc<dyn MessageHandler>,
    retry_backoff: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut position = partition.join(&group)?;

    loop {
        let appended = partition.appended.notified();
        match partition.read(position)? {
            Some(message) => match deliver(handler.as_ref(), &message).await {
                Disposition::Commit => {
                    partition.commit(&group, message.offset + 1)?;
                    position = message.offset + 1;
                }
                Disposition::Hold => {
                    tracing::debug!(
                        group = %group,
                        offset = message.offset,
                        backoff_ms = retry_backoff.as_millis() as u64,
                        "Rewinding to held message"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(retry_backoff) => {}
                    }
                    position = message.offset;
                }
            },
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = appended => {}
                }
            }
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
    }
}
