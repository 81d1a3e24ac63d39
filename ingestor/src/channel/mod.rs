//! Message channel contract between the publisher and the ingest worker.
//!
//! A channel is a durable, partitioned queue with consumer-group delivery:
//! every message reaches exactly one member of a group, and a message stays
//! pending until that member acknowledges it.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;

use crate::errors::Result;

/// Submits payloads to the channel.
#[async_trait]
pub trait ChannelProducer: Send + Sync {
    /// Returns once the broker accepted the payload for delivery.
    /// `key` selects the partition, so payloads sharing a key stay ordered.
    async fn send(&self, key: &str, payload: Vec<u8>) -> Result<()>;
}

/// One member of a consumer group.
#[async_trait]
pub trait ChannelConsumer: Send {
    /// Joins the consumer group.
    async fn subscribe(&mut self) -> Result<()>;

    /// Waits for the next message. Cancel-safe: dropping the future loses
    /// nothing.
    async fn poll(&mut self) -> Result<Delivery>;

    /// Marks the delivery as processed; it will not be delivered again.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Gives the delivery back unacknowledged so the next poll returns it.
    async fn release(&mut self, delivery: Delivery) -> Result<()>;
}

/// A message handed to a consumer, plus what the backend needs to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub key: String,
    pub payload: Vec<u8>,
    pub(crate) receipt: Receipt,
}

#[derive(Debug, Clone)]
pub(crate) enum Receipt {
    Memory { partition: usize, offset: u64 },
    Mqtt(Box<rumqttc::Publish>),
}
