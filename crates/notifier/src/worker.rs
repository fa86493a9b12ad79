//! Delivery worker: consumes email payloads and drives each one through
//! bounded, backed-off transport attempts.
//!
//! The channel offset is confirmed as soon as a payload is decoded and handed
//! off; from then on failures are tracked only through the ledger. Backoff
//! waits are timers inside the dispatch task and hold no pool slot, so the
//! pool bound applies to concurrent transport calls only. A separate bound on
//! pending dispatches, backed-off ones included, makes the consumer wait
//! before taking more records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use courier_common::error::AppError;
use courier_common::types::Topic;

use crate::backoff::BackoffSchedule;
use crate::channel::{
    ConsumerPolicy, Envelope, MessageChannel, RecordHandler, decode_payload, run_consumer,
};
use crate::ledger::{AttemptResult, FailedMessageLedger};
use crate::transport::MailTransport;

/// In-flight state of one dispatch. Discarded once the outcome is recorded.
#[derive(Debug, Clone, Default)]
pub struct DeliveryAttempt {
    pub attempts: u32,
    pub last_error: Option<String>,
    pub elapsed_backoff: Duration,
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32, error: String },
    /// Shutdown arrived before the dispatch resolved either way.
    Interrupted { attempts: u32, last_error: Option<String> },
}

#[derive(Clone)]
pub struct DeliveryWorker {
    transport: Arc<dyn MailTransport>,
    ledger: Arc<dyn FailedMessageLedger>,
    schedule: BackoffSchedule,
    pool: Arc<Semaphore>,
    pending: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Default cap on dispatches that are running or waiting out a backoff.
pub const DEFAULT_MAX_PENDING: usize = 1024;

impl DeliveryWorker {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        ledger: Arc<dyn FailedMessageLedger>,
        schedule: BackoffSchedule,
        pool_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            ledger,
            schedule,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            pending: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING)),
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.pending = Arc::new(Semaphore::new(max_pending.max(1)));
        self
    }

    /// Consume the email topic until shutdown, then wait for in-flight dispatches.
    pub async fn run(
        &self,
        channel: &dyn MessageChannel,
        policy: ConsumerPolicy,
    ) -> Result<(), AppError> {
        let topic = Topic::EmailNotifications;
        let subscription = channel
            .subscribe(topic.as_str(), topic.consumer_group())
            .await?;

        let result = run_consumer(
            subscription,
            policy,
            Arc::new(self.clone()),
            self.shutdown.clone(),
            "delivery-worker",
        )
        .await;

        self.drain().await;
        result
    }

    /// Stop accepting dispatches and wait for the running ones to settle.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("In-flight dispatches settled");
    }

    /// Start a dispatch in the background once a pending slot is free.
    ///
    /// If shutdown arrives first the pair is handed to the reconciler through
    /// the ledger instead.
    pub async fn enqueue(&self, envelope: Envelope) {
        let slot = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            slot = self.pending.clone().acquire_owned() => slot.ok(),
        };
        let Some(slot) = slot else {
            let outcome = DispatchOutcome::Interrupted {
                attempts: 0,
                last_error: None,
            };
            self.record_outcome(&envelope.recipient, &envelope.body, &outcome)
                .await;
            return;
        };

        let worker = self.clone();
        self.tasks.spawn(async move {
            let _slot: OwnedSemaphorePermit = slot;
            worker.dispatch(&envelope.recipient, &envelope.body).await;
        });
    }

    /// Attempt delivery and record the outcome in the ledger.
    pub async fn dispatch(&self, recipient: &str, body: &str) -> DispatchOutcome {
        let outcome = self.attempt_delivery(recipient, body).await;
        self.record_outcome(recipient, body, &outcome).await;
        outcome
    }

    async fn attempt_delivery(&self, recipient: &str, body: &str) -> DispatchOutcome {
        let mut attempt = DeliveryAttempt::default();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                permit = self.pool.acquire() => permit.ok(),
            };
            let Some(permit) = permit else {
                return DispatchOutcome::Interrupted {
                    attempts: attempt.attempts,
                    last_error: attempt.last_error,
                };
            };

            let result = self.transport.send(recipient, body).await;
            drop(permit);
            attempt.attempts += 1;

            let error = match result {
                Ok(()) => {
                    return DispatchOutcome::Delivered {
                        attempts: attempt.attempts,
                    };
                }
                Err(e) => e.to_string(),
            };

            let Some(delay) = self.schedule.delay_after(attempt.attempts) else {
                return DispatchOutcome::Exhausted {
                    attempts: attempt.attempts,
                    error,
                };
            };

            tracing::warn!(
                recipient,
                attempt = attempt.attempts,
                delay_secs = delay.as_secs(),
                error = %error,
                "Email delivery failed, backing off"
            );
            attempt.last_error = Some(error);

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return DispatchOutcome::Interrupted {
                        attempts: attempt.attempts,
                        last_error: attempt.last_error,
                    };
                }
                _ = tokio::time::sleep(delay) => {
                    attempt.elapsed_backoff += delay;
                }
            }
        }
    }

    async fn record_outcome(&self, recipient: &str, body: &str, outcome: &DispatchOutcome) {
        let recorded = match outcome {
            DispatchOutcome::Delivered { attempts } => {
                tracing::info!(recipient, attempts, "Email sent");
                self.ledger
                    .upsert_by_recipient_and_body(recipient, body, &AttemptResult::Delivered)
                    .await
                    .map(|_| ())
            }
            DispatchOutcome::Exhausted { attempts, error } => {
                tracing::warn!(recipient, attempts, error = %error, "Email not sent after retries");
                self.ledger
                    .upsert_by_recipient_and_body(
                        recipient,
                        body,
                        &AttemptResult::Failed(error.clone()),
                    )
                    .await
                    .map(|_| ())
            }
            DispatchOutcome::Interrupted {
                attempts,
                last_error,
            } => {
                // Neither success nor failure: only make sure the reconciler
                // will find the pair.
                tracing::info!(recipient, attempts, "Dispatch interrupted by shutdown");
                let reason = format!(
                    "interrupted: {}",
                    last_error.as_deref().unwrap_or("no attempt completed")
                );
                self.ledger
                    .track_unresolved(recipient, body, &reason)
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = recorded {
            tracing::error!(recipient, error = %e, "Failed to record dispatch outcome");
        }
    }
}

#[async_trait]
impl RecordHandler for DeliveryWorker {
    async fn handle(&self, payload: &str) -> Result<(), AppError> {
        match decode_payload(payload) {
            Some(envelope) => self.enqueue(envelope).await,
            None => {
                tracing::debug!(payload_len = payload.len(), "Dropping malformed email payload");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::testing::ScriptedTransport;

    fn worker(
        transport: Arc<ScriptedTransport>,
        ledger: Arc<InMemoryLedger>,
        shutdown: CancellationToken,
    ) -> DeliveryWorker {
        DeliveryWorker::new(transport, ledger, BackoffSchedule::standard(), 4, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let transport = Arc::new(ScriptedTransport::failing_times(2));
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = worker(transport.clone(), ledger.clone(), CancellationToken::new());

        let started = Instant::now();
        let outcome = worker.dispatch("alice@example.com", "hi").await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 3 });
        assert_eq!(transport.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(360));

        let row = ledger.find("alice@example.com", "hi").await.unwrap().unwrap();
        assert!(row.sent);
        assert_eq!(row.error, None);
        assert!(row.last_tried_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_records_last_error() {
        let transport = Arc::new(ScriptedTransport::always_failing());
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = worker(transport.clone(), ledger.clone(), CancellationToken::new());

        let started = Instant::now();
        let outcome = worker.dispatch("alice@example.com", "hi").await;

        assert!(matches!(outcome, DispatchOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
        // No wait after the final attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(360));

        let row = ledger.find("alice@example.com", "hi").await.unwrap().unwrap();
        assert!(!row.sent);
        assert_eq!(row.retry_count, 0);
        assert_eq!(
            row.error.as_deref(),
            Some("mail gateway unavailable (call 3)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_leaves_row_unresolved() {
        let transport = Arc::new(ScriptedTransport::always_failing());
        let ledger = Arc::new(InMemoryLedger::new());
        let shutdown = CancellationToken::new();
        let worker = worker(transport.clone(), ledger.clone(), shutdown.clone());

        let task = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.dispatch("alice@example.com", "hi").await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.cancel();
        let outcome = task.await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Interrupted {
                attempts: 1,
                last_error: Some("mail gateway unavailable (call 1)".to_string()),
            }
        );
        assert_eq!(transport.calls(), 1);

        let row = ledger.find("alice@example.com", "hi").await.unwrap().unwrap();
        assert!(!row.sent);
        assert_eq!(row.retry_count, 0);
        assert!(row.error.unwrap().starts_with("interrupted:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_does_not_touch_existing_row() {
        let transport = Arc::new(ScriptedTransport::always_failing());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .upsert_by_recipient_and_body("a", "b", &AttemptResult::Failed("earlier".into()))
            .await
            .unwrap();
        let before = ledger.find("a", "b").await.unwrap().unwrap();

        let shutdown = CancellationToken::new();
        let worker = worker(transport, ledger.clone(), shutdown.clone());
        let task = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.dispatch("a", "b").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(ledger.find("a", "b").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_transport_calls() {
        let transport = Arc::new(
            ScriptedTransport::always_ok().with_latency(Duration::from_millis(20)),
        );
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = DeliveryWorker::new(
            transport.clone(),
            ledger.clone(),
            BackoffSchedule::standard(),
            2,
            CancellationToken::new(),
        );

        for i in 0..6 {
            worker
                .enqueue(Envelope {
                    recipient: format!("user{}@example.com", i),
                    body: "hi".to_string(),
                })
                .await;
        }
        worker.drain().await;

        assert_eq!(transport.calls(), 6);
        assert!(transport.peak_in_flight() <= 2);
        assert_eq!(ledger.len().await, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_dispatches_are_bounded() {
        let transport = Arc::new(ScriptedTransport::always_failing());
        let ledger = Arc::new(InMemoryLedger::new());
        let shutdown = CancellationToken::new();
        let worker = worker(transport.clone(), ledger.clone(), shutdown.clone()).with_max_pending(2);

        for i in 0..2 {
            worker
                .enqueue(Envelope {
                    recipient: format!("user{}@example.com", i),
                    body: "hi".to_string(),
                })
                .await;
        }

        // Both slots are held by dispatches sleeping in backoff.
        let third = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .enqueue(Envelope {
                        recipient: "user2@example.com".to_string(),
                        body: "hi".to_string(),
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!third.is_finished());
        assert_eq!(transport.calls(), 2);

        // A freed slot lets the waiting record through.
        tokio::time::sleep(Duration::from_secs(400)).await;
        third.await.unwrap();
        worker.drain().await;
        assert_eq!(transport.calls(), 9);
        assert_eq!(ledger.len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_for_slot_tracks_pair() {
        let transport = Arc::new(ScriptedTransport::always_failing());
        let ledger = Arc::new(InMemoryLedger::new());
        let shutdown = CancellationToken::new();
        let worker = worker(transport.clone(), ledger.clone(), shutdown.clone()).with_max_pending(1);

        worker
            .enqueue(Envelope {
                recipient: "first@example.com".to_string(),
                body: "hi".to_string(),
            })
            .await;
        let waiting = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .enqueue(Envelope {
                        recipient: "second@example.com".to_string(),
                        body: "hi".to_string(),
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        waiting.await.unwrap();
        worker.drain().await;

        let row = ledger.find("second@example.com", "hi").await.unwrap().unwrap();
        assert!(!row.sent);
        assert_eq!(row.error.as_deref(), Some("interrupted: no attempt completed"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let transport = Arc::new(ScriptedTransport::always_ok());
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = worker(transport.clone(), ledger.clone(), CancellationToken::new());

        worker.handle("no-delimiter").await.unwrap();
        worker.drain().await;

        assert_eq!(transport.calls(), 0);
        assert!(ledger.is_empty().await);
    }
}
