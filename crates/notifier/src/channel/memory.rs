//! In-process channel with the same group semantics as the Redis binding.
//!
//! Used by tests and by single-process embeddings. Each topic is a set of
//! append-only partition logs; each consumer group keeps one cursor per
//! partition shared by all of its subscriptions. Records a subscription was
//! handed but never confirmed go back to the group when it is dropped.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use courier_common::error::AppError;

use super::{ChannelLayout, Delivery, MessageChannel, OffsetHandle, Subscription, partition_for};

#[derive(Debug, Clone)]
struct Record {
    key: String,
    payload: String,
}

#[derive(Debug, Default)]
struct GroupState {
    cursors: Vec<usize>,
    redeliver: VecDeque<(usize, usize)>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Record>>>,
    groups: HashMap<(String, String), GroupState>,
    unavailable: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    layout: ChannelLayout,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to an in-memory channel; clones share the same logs.
#[derive(Debug, Clone)]
pub struct InMemoryChannel {
    shared: Arc<Shared>,
}

impl InMemoryChannel {
    pub fn new(layout: ChannelLayout) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                layout,
            }),
        }
    }

    /// Simulate a broker outage: publishes and new subscriptions fail with
    /// `ChannelUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.lock().unavailable = unavailable;
    }

    /// Every payload ever published to `topic`, partition by partition.
    pub fn published(&self, topic: &str) -> Vec<String> {
        let state = self.shared.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flat_map(|log| log.iter().map(|r| r.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ensure_topic<'a>(&self, state: &'a mut State, topic: &str) -> &'a mut Vec<Vec<Record>> {
        let partitions = self.shared.layout.partitions_of(topic);
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(ChannelLayout::default())
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), AppError> {
        {
            let mut state = self.shared.lock();
            if state.unavailable {
                return Err(AppError::ChannelUnavailable(format!(
                    "topic {} is not accepting records",
                    topic
                )));
            }
            let logs = self.ensure_topic(&mut state, topic);
            let partition = partition_for(key, logs.len());
            logs[partition].push(Record {
                key: key.to_string(),
                payload: payload.to_string(),
            });
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, AppError> {
        {
            let mut state = self.shared.lock();
            if state.unavailable {
                return Err(AppError::ChannelUnavailable(format!(
                    "cannot join group {} on topic {}",
                    group, topic
                )));
            }
            let partitions = self.ensure_topic(&mut state, topic).len();
            let group_state = state
                .groups
                .entry((topic.to_string(), group.to_string()))
                .or_default();
            group_state.cursors.resize(partitions, 0);
        }

        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            in_flight: BTreeSet::new(),
            next_partition: 0,
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    in_flight: BTreeSet<(usize, usize)>,
    next_partition: usize,
}

impl MemorySubscription {
    fn try_take(&mut self) -> Option<Delivery> {
        let mut state = self.shared.lock();
        let State { topics, groups, .. } = &mut *state;
        let logs = topics.get(&self.topic)?;
        let group = groups.get_mut(&(self.topic.clone(), self.group.clone()))?;

        let (partition, offset) = match group.redeliver.pop_front() {
            Some(position) => position,
            None => {
                let partitions = logs.len();
                let found = (0..partitions)
                    .map(|i| (self.next_partition + i) % partitions)
                    .find(|p| group.cursors[*p] < logs[*p].len())?;
                let offset = group.cursors[found];
                group.cursors[found] += 1;
                self.next_partition = (found + 1) % partitions;
                (found, offset)
            }
        };

        let record = logs.get(partition)?.get(offset)?.clone();
        self.in_flight.insert((partition, offset));

        Some(Delivery {
            key: Some(record.key),
            payload: record.payload,
            handle: OffsetHandle {
                topic: self.topic.clone(),
                partition,
                offset: offset.to_string(),
            },
        })
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery, AppError> {
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn confirm(&mut self, handle: &OffsetHandle) -> Result<(), AppError> {
        let offset: usize = handle
            .offset
            .parse()
            .map_err(|_| AppError::Validation(format!("invalid offset '{}'", handle.offset)))?;
        self.in_flight.remove(&(handle.partition, offset));
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }

        {
            let mut state = self.shared.lock();
            if let Some(group) = state
                .groups
                .get_mut(&(self.topic.clone(), self.group.clone()))
            {
                group.redeliver.extend(std::mem::take(&mut self.in_flight));
            }
        }
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_group_members_split_records() {
        let channel = InMemoryChannel::default();
        let mut a = channel.subscribe("t", "g").await.unwrap();
        let mut b = channel.subscribe("t", "g").await.unwrap();

        channel.publish("t", "k", "one").await.unwrap();
        channel.publish("t", "k", "two").await.unwrap();

        let first = a.next().await.unwrap();
        let second = b.next().await.unwrap();
        assert_eq!(first.payload, "one");
        assert_eq!(second.payload, "two");
    }

    #[tokio::test]
    async fn test_each_group_sees_every_record() {
        let channel = InMemoryChannel::default();
        channel.publish("t", "k", "hello").await.unwrap();

        let mut workers = channel.subscribe("t", "workers").await.unwrap();
        let mut auditors = channel.subscribe("t", "auditors").await.unwrap();
        assert_eq!(workers.next().await.unwrap().payload, "hello");
        assert_eq!(auditors.next().await.unwrap().payload, "hello");
    }

    #[tokio::test]
    async fn test_unconfirmed_records_are_redelivered() {
        let channel = InMemoryChannel::default();
        channel.publish("t", "k", "keep me").await.unwrap();
        channel.publish("t", "k", "done").await.unwrap();

        {
            let mut sub = channel.subscribe("t", "g").await.unwrap();
            let _lost = sub.next().await.unwrap();
            let done = sub.next().await.unwrap();
            sub.confirm(&done.handle).await.unwrap();
        }

        let mut sub = channel.subscribe("t", "g").await.unwrap();
        let again = sub.next().await.unwrap();
        assert_eq!(again.payload, "keep me");

        let nothing = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let channel = InMemoryChannel::default();
        let mut sub = channel.subscribe("t", "g").await.unwrap();

        let publisher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("t", "k", "late").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, "late");
    }

    #[tokio::test]
    async fn test_per_key_order_within_partition() {
        let channel = InMemoryChannel::new(ChannelLayout::default().with_partitions("t", 3));
        for i in 0..5 {
            channel.publish("t", "alice", &format!("m{}", i)).await.unwrap();
        }

        let mut sub = channel.subscribe("t", "g").await.unwrap();
        for i in 0..5 {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.payload, format!("m{}", i));
            assert_eq!(delivery.key.as_deref(), Some("alice"));
        }
    }

    #[tokio::test]
    async fn test_unavailable_channel_rejects_publish() {
        let channel = InMemoryChannel::default();
        channel.set_unavailable(true);
        let err = channel.publish("t", "k", "x").await.unwrap_err();
        assert!(matches!(err, AppError::ChannelUnavailable(_)));
        assert!(channel.published("t").is_empty());
        assert!(matches!(
            channel.subscribe("t", "g").await.err(),
            Some(AppError::ChannelUnavailable(_))
        ));
    }
}
