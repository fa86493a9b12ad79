//! Redis Streams binding of the message channel.
//!
//! Each topic partition is its own stream, `{prefix}:{topic}:{partition}`.
//! Consumer groups map onto Redis consumer groups, created from the start of
//! the stream so records published before the first consumer are not lost.
//!
//! A subscription first drains the entries still pending for its consumer name
//! (`XREADGROUP ... 0`), which is how a restarted process picks up records it
//! was handed but never confirmed, then switches to new entries (`>`).

use std::collections::VecDeque;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult};

use courier_common::config::AppConfig;
use courier_common::error::AppError;

use super::{ChannelLayout, Delivery, MessageChannel, OffsetHandle, Subscription, partition_for};

/// Entries fetched per XREADGROUP call.
const READ_BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisChannelOptions {
    pub prefix: String,
    pub consumer_name: String,
    pub block_ms: u64,
    pub max_len: usize,
    pub layout: ChannelLayout,
}

impl RedisChannelOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            prefix: config.channel_stream_prefix.clone(),
            consumer_name: config.channel_consumer_name.clone(),
            block_ms: config.channel_block_ms,
            max_len: config.channel_stream_max_len,
            layout: ChannelLayout::from_config(config),
        }
    }

    pub fn stream_key(&self, topic: &str, partition: usize) -> String {
        format!("{}:{}:{}", self.prefix, topic, partition)
    }
}

#[derive(Clone)]
pub struct RedisStreamChannel {
    client: Client,
    publisher: ConnectionManager,
    options: RedisChannelOptions,
}

impl RedisStreamChannel {
    pub fn new(client: Client, publisher: ConnectionManager, options: RedisChannelOptions) -> Self {
        Self {
            client,
            publisher,
            options,
        }
    }

    fn stream_keys(&self, topic: &str) -> Vec<String> {
        (0..self.options.layout.partitions_of(topic))
            .map(|p| self.options.stream_key(topic, p))
            .collect()
    }

    async fn ensure_group(
        conn: &mut MultiplexedConnection,
        stream_key: &str,
        group: &str,
    ) -> Result<(), AppError> {
        let result: RedisResult<()> = conn.xgroup_create_mkstream(stream_key, group, "0").await;

        match result {
            Ok(()) => {
                tracing::info!(stream = %stream_key, group, "Created consumer group");
                Ok(())
            }
            // BUSYGROUP: the group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream = %stream_key, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(AppError::channel(e)),
        }
    }
}

#[async_trait]
impl MessageChannel for RedisStreamChannel {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), AppError> {
        let partition = partition_for(key, self.options.layout.partitions_of(topic));
        let stream_key = self.options.stream_key(topic, partition);
        let mut conn = self.publisher.clone();

        // XADD stream MAXLEN ~ max_len * key <key> payload <payload>
        let stream_id: String = redis::cmd("XADD")
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.options.max_len)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(AppError::channel)?;

        tracing::debug!(stream = %stream_key, stream_id = %stream_id, "Published record");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, AppError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::channel)?;

        let keys = self.stream_keys(topic);
        for key in &keys {
            Self::ensure_group(&mut conn, key, group).await?;
        }

        tracing::info!(
            topic,
            group,
            consumer = %self.options.consumer_name,
            partitions = keys.len(),
            "Subscribed to channel"
        );

        Ok(Box::new(RedisSubscription {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: self.options.consumer_name.clone(),
            keys,
            block_ms: self.options.block_ms,
            backlog: VecDeque::new(),
            draining_pending: true,
        }))
    }
}

struct RedisSubscription {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    keys: Vec<String>,
    block_ms: u64,
    backlog: VecDeque<Delivery>,
    draining_pending: bool,
}

impl RedisSubscription {
    async fn fill(&mut self) -> Result<(), AppError> {
        let start = if self.draining_pending { "0" } else { ">" };
        let ids = vec![start; self.keys.len()];

        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH);
        if !self.draining_pending {
            options = options.block(self.block_ms as usize);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&self.keys, &ids, &options)
            .await
            .map_err(AppError::channel)?;

        let mut received = 0usize;
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            let partition = self
                .keys
                .iter()
                .position(|k| *k == stream.key)
                .unwrap_or_default();

            for entry in stream.ids {
                received += 1;
                // Trimmed entries come back without fields; an empty payload
                // decodes as malformed and is confirmed away by the consumer.
                let payload: String = entry.get("payload").unwrap_or_default();
                let key: Option<String> = entry.get("key");
                self.backlog.push_back(Delivery {
                    key,
                    payload,
                    handle: OffsetHandle {
                        topic: self.topic.clone(),
                        partition,
                        offset: entry.id,
                    },
                });
            }
        }

        if self.draining_pending && received == 0 {
            tracing::debug!(topic = %self.topic, group = %self.group, "Pending entries drained");
            self.draining_pending = false;
        }

        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Result<Delivery, AppError> {
        loop {
            if let Some(delivery) = self.backlog.pop_front() {
                return Ok(delivery);
            }
            self.fill().await?;
        }
    }

    async fn confirm(&mut self, handle: &OffsetHandle) -> Result<(), AppError> {
        let stream_key = self.keys.get(handle.partition).ok_or_else(|| {
            AppError::Validation(format!(
                "partition {} out of range for {}",
                handle.partition, handle.topic
            ))
        })?;

        let acked: i64 = self
            .conn
            .xack(stream_key, &self.group, &[&handle.offset])
            .await
            .map_err(AppError::channel)?;

        if acked == 0 {
            tracing::warn!(
                stream = %stream_key,
                offset = %handle.offset,
                "Record was not pending when confirmed"
            );
        }
        Ok(())
    }
}
