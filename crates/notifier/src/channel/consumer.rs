//! Consumer loop: reads a subscription, hands each record to a handler and
//! confirms it.
//!
//! A failing handler is retried with exponential backoff up to
//! `max_retries` times; after that the record is logged and confirmed anyway so one
//! bad record can't wedge the group. Shutdown stops the loop between records,
//! or during a handler backoff, leaving that record unconfirmed for redelivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_common::error::AppError;

use super::{Delivery, Subscription};

/// Processes one channel payload.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, payload: &str) -> Result<(), AppError>;
}

/// Retry policy applied to handler failures.
#[derive(Debug, Clone)]
pub struct ConsumerPolicy {
    /// Re-invocations after the first failed one. `3` means at most four calls.
    pub max_retries: u32,

    /// Delay after the first failure.
    pub initial_interval: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_interval: Duration,
}

impl Default for ConsumerPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl ConsumerPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the next invocation, given how many have failed so far (1-indexed).
    ///
    /// `initial_interval * multiplier^(failures - 1)`, capped at `max_interval`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()))
    }
}

enum Handled {
    Done,
    GaveUp,
    Interrupted,
}

/// Drive `subscription` until `shutdown` is cancelled.
pub async fn run_consumer(
    mut subscription: Box<dyn Subscription>,
    policy: ConsumerPolicy,
    handler: Arc<dyn RecordHandler>,
    shutdown: CancellationToken,
    name: &str,
) -> Result<(), AppError> {
    tracing::info!(consumer = name, "Consumer loop started");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = subscription.next() => next,
        };

        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!(consumer = name, error = %e, "Channel read failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(policy.initial_interval) => continue,
                }
            }
        };

        match handle_with_retry(&delivery, &policy, handler.as_ref(), &shutdown, name).await {
            Handled::Done | Handled::GaveUp => {
                if let Err(e) = subscription.confirm(&delivery.handle).await {
                    tracing::warn!(
                        consumer = name,
                        offset = %delivery.handle.offset,
                        error = %e,
                        "Failed to confirm record"
                    );
                }
            }
            Handled::Interrupted => break,
        }
    }

    tracing::info!(consumer = name, "Consumer loop stopped");
    Ok(())
}

async fn handle_with_retry(
    delivery: &Delivery,
    policy: &ConsumerPolicy,
    handler: &dyn RecordHandler,
    shutdown: &CancellationToken,
    name: &str,
) -> Handled {
    let max_attempts = policy.max_retries.saturating_add(1);

    for attempt in 1..=max_attempts {
        let error = match handler.handle(&delivery.payload).await {
            Ok(()) => return Handled::Done,
            Err(e) => e,
        };

        if attempt == max_attempts {
            tracing::error!(
                consumer = name,
                topic = %delivery.handle.topic,
                offset = %delivery.handle.offset,
                attempts = attempt,
                error = %error,
                "Giving up on record"
            );
            break;
        }

        let delay = policy.delay_after(attempt);
        tracing::warn!(
            consumer = name,
            offset = %delivery.handle.offset,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Handler failed, retrying"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Handled::Interrupted,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Handled::GaveUp
}
