//! Message channel: durable, partitioned publish/subscribe with consumer groups.
//!
//! Delivery is at-least-once. A record handed to a subscription stays pending
//! until its [`OffsetHandle`] is confirmed; unconfirmed records are handed out
//! again after the consumer restarts or the subscription is dropped.

pub mod codec;
pub mod consumer;
pub mod memory;
pub mod redis_stream;

use std::collections::HashMap;

use async_trait::async_trait;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::Topic;

pub use codec::{Envelope, decode_payload, encode_payload};
pub use consumer::{ConsumerPolicy, RecordHandler, run_consumer};
pub use memory::InMemoryChannel;
pub use redis_stream::{RedisChannelOptions, RedisStreamChannel};

/// Position of a delivered record, used to confirm consumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetHandle {
    pub topic: String,
    pub partition: usize,
    pub offset: String,
}

/// A record handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Partition key the record was published with, when the backend keeps it.
    pub key: Option<String>,
    pub payload: String,
    pub handle: OffsetHandle,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Append `payload` to `topic`, routed to a partition by `key`.
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), AppError>;

    /// Join consumer group `group` on `topic`.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, AppError>;
}

/// A lazy, unbounded sequence of deliveries for one consumer group member.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next record. Never returns "end of stream".
    async fn next(&mut self) -> Result<Delivery, AppError>;

    /// Commit consumption of a delivered record.
    async fn confirm(&mut self, handle: &OffsetHandle) -> Result<(), AppError>;
}

/// Partition counts per topic. Topics not listed have a single partition.
#[derive(Debug, Clone, Default)]
pub struct ChannelLayout {
    partitions: HashMap<String, usize>,
}

impl ChannelLayout {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::default().with_partitions(
            Topic::EmailNotifications.as_str(),
            config.email_topic_partitions,
        )
    }

    pub fn with_partitions(mut self, topic: &str, partitions: usize) -> Self {
        self.partitions.insert(topic.to_string(), partitions.max(1));
        self
    }

    pub fn partitions_of(&self, topic: &str) -> usize {
        self.partitions.get(topic).copied().unwrap_or(1)
    }
}

/// Stable partition for `key` (FNV-1a), so one recipient always lands on the
/// same partition across processes and restarts.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % partitions as u64) as usize
}
