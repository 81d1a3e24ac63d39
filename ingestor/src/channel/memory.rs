//! In-process partitioned broker.
//!
//! Topics are split into a fixed number of partitions; the key hash selects
//! the partition. Each consumer group tracks a committed offset per partition
//! and assigns partitions round-robin to its members. Membership changes
//! rebalance the group and rewind reassigned partitions to the committed
//! offset, so unacknowledged messages are delivered again. Records every
//! group has committed are dropped from the log. State lives in memory only
//! and does not survive the process.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{ChannelConsumer, ChannelProducer, Delivery, Receipt};
use crate::errors::{Error, Result};

pub const DEFAULT_PARTITIONS: usize = 8;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    partitions: usize,
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    next_member: u64,
}

struct Topic {
    log: Vec<Partition>,
    groups: HashMap<String, Group>,
}

/// Retained suffix of a partition; `base` is the offset of `records[0]`.
#[derive(Default)]
struct Partition {
    base: u64,
    records: VecDeque<Record>,
}

impl Partition {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Record> {
        let index = offset.checked_sub(self.base)?;
        self.records.get(index as usize)
    }

    fn truncate_before(&mut self, offset: u64) {
        while self.base < offset && self.records.pop_front().is_some() {
            self.base += 1;
        }
    }
}

struct Record {
    key: String,
    payload: Vec<u8>,
}

struct Group {
    members: Vec<u64>,
    owners: Vec<Option<u64>>,
    committed: Vec<u64>,
    positions: Vec<u64>,
}

impl Topic {
    fn new(partitions: usize) -> Self {
        Self {
            log: (0..partitions).map(|_| Partition::default()).collect(),
            groups: HashMap::new(),
        }
    }
}

impl Topic {
    /// Drops records of `partition` that every group has committed.
    fn compact(&mut self, partition: usize) {
        let Some(floor) = self.groups.values().map(|g| g.committed[partition]).min() else {
            return;
        };
        self.log[partition].truncate_before(floor);
    }
}

impl Group {
    /// A new group starts at the oldest retained record of each partition.
    fn new(log: &[Partition]) -> Self {
        let start: Vec<u64> = log.iter().map(|p| p.base).collect();
        Self {
            members: Vec::new(),
            owners: vec![None; log.len()],
            committed: start.clone(),
            positions: start,
        }
    }

    fn rebalance(&mut self) {
        self.members.sort_unstable();
        for partition in 0..self.owners.len() {
            let owner = if self.members.is_empty() {
                None
            } else {
                Some(self.members[partition % self.members.len()])
            };
            if self.owners[partition] != owner {
                self.owners[partition] = owner;
                self.positions[partition] = self.committed[partition];
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn producer(&self, topic: impl Into<String>) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            topic: topic.into(),
        }
    }

    pub fn consumer(&self, topic: impl Into<String>, group: impl Into<String>) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            topic: topic.into(),
            group: group.into(),
            member: None,
            cursor: 0,
        }
    }

    /// Messages published to `topic` and not yet committed by `group`.
    pub fn lag(&self, topic: &str, group: &str) -> u64 {
        let state = self.inner.state.lock();
        let Some(topic) = state.topics.get(topic) else {
            return 0;
        };
        topic
            .log
            .iter()
            .enumerate()
            .map(|(index, partition)| {
                let committed = topic
                    .groups
                    .get(group)
                    .map(|g| g.committed[index])
                    .unwrap_or(partition.base);
                partition.end().saturating_sub(committed)
            })
            .sum()
    }

    /// Records still held for `topic` across all partitions.
    pub fn retained(&self, topic: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|t| t.log.iter().map(|p| p.records.len()).sum())
            .unwrap_or(0)
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    fn topic_mut<'a>(&self, state: &'a mut BrokerState, topic: &str) -> &'a mut Topic {
        let partitions = self.inner.partitions;
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(partitions))
    }
}

#[derive(Clone)]
pub struct MemoryProducer {
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl ChannelProducer for MemoryProducer {
    async fn send(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let partition = self.broker.partition_for(key);
        {
            let mut state = self.broker.inner.state.lock();
            let topic = self.broker.topic_mut(&mut state, &self.topic);
            topic.log[partition].records.push_back(Record {
                key: key.to_string(),
                payload,
            });
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    group: String,
    member: Option<u64>,
    cursor: usize,
}

impl MemoryConsumer {
    fn try_next(&mut self, member: u64) -> Option<Delivery> {
        let mut state = self.broker.inner.state.lock();
        let Topic { log, groups } = state.topics.get_mut(&self.topic)?;
        let group = groups.get_mut(&self.group)?;
        let partitions = log.len();

        for step in 0..partitions {
            let partition = (self.cursor + step) % partitions;
            if group.owners[partition] != Some(member) {
                continue;
            }
            let offset = group.positions[partition];
            let Some(record) = log[partition].get(offset) else {
                continue;
            };
            group.positions[partition] = offset + 1;
            self.cursor = (partition + 1) % partitions;
            return Some(Delivery {
                key: record.key.clone(),
                payload: record.payload.clone(),
                receipt: Receipt::Memory { partition, offset },
            });
        }
        None
    }

    fn leave(&mut self) {
        let Some(member) = self.member.take() else {
            return;
        };
        {
            let mut state = self.broker.inner.state.lock();
            if let Some(group) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|topic| topic.groups.get_mut(&self.group))
            {
                group.members.retain(|m| *m != member);
                group.rebalance();
            }
        }
        self.broker.inner.notify.notify_waiters();
        debug!(group = %self.group, member, "Consumer left group");
    }
}

#[async_trait]
impl ChannelConsumer for MemoryConsumer {
    async fn subscribe(&mut self) -> Result<()> {
        if self.member.is_some() {
            return Ok(());
        }
        let member = {
            let mut state = self.broker.inner.state.lock();
            let member = state.next_member;
            state.next_member += 1;
            let topic = self.broker.topic_mut(&mut state, &self.topic);
            let Topic { log, groups } = topic;
            let group = groups
                .entry(self.group.clone())
                .or_insert_with(|| Group::new(log.as_slice()));
            group.members.push(member);
            group.rebalance();
            member
        };
        self.member = Some(member);
        self.broker.inner.notify.notify_waiters();
        info!(topic = %self.topic, group = %self.group, member, "Joined consumer group");
        Ok(())
    }

    async fn poll(&mut self) -> Result<Delivery> {
        let member = self
            .member
            .ok_or_else(|| Error::ChannelUnavailable("consumer is not subscribed".to_string()))?;
        let inner = Arc::clone(&self.broker.inner);

        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next(member) {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let Receipt::Memory { partition, offset } = delivery.receipt else {
            return Err(Error::ChannelUnavailable(
                "delivery does not belong to this broker".to_string(),
            ));
        };
        let mut state = self.broker.inner.state.lock();
        let Some(topic) = state.topics.get_mut(&self.topic) else {
            return Ok(());
        };
        if let Some(group) = topic.groups.get_mut(&self.group) {
            let committed = &mut group.committed[partition];
            *committed = (*committed).max(offset + 1);
            topic.compact(partition);
        }
        Ok(())
    }

    async fn release(&mut self, delivery: Delivery) -> Result<()> {
        let Receipt::Memory { partition, offset } = delivery.receipt else {
            return Err(Error::ChannelUnavailable(
                "delivery does not belong to this broker".to_string(),
            ));
        };
        {
            let mut state = self.broker.inner.state.lock();
            if let Some(group) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|topic| topic.groups.get_mut(&self.group))
            {
                // Only the current owner may rewind; after a rebalance the new
                // owner already restarted from the committed offset.
                if group.owners[partition] == self.member && group.positions[partition] > offset {
                    group.positions[partition] = offset;
                }
            }
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.leave();
    }
}
