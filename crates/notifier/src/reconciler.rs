//! Retry reconciler: periodically re-attempts unsent ledger rows.
//!
//! Each sweep makes exactly one transport attempt per eligible row. The
//! ledger update is guarded, so a row the worker resolved mid-sweep is
//! skipped rather than overwritten.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use courier_common::error::AppError;

use crate::ledger::{AttemptResult, FailedMessageLedger};
use crate::transport::MailTransport;

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub recovered: usize,
    pub failed: usize,
    /// Rows that reached the ceiling during this sweep.
    pub exhausted: usize,
    /// Rows another writer changed before the attempt was recorded.
    pub skipped: usize,
}

pub struct RetryReconciler {
    transport: Arc<dyn MailTransport>,
    ledger: Arc<dyn FailedMessageLedger>,
    ceiling: u32,
    interval: Duration,
}

impl RetryReconciler {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        ledger: Arc<dyn FailedMessageLedger>,
        ceiling: u32,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            ledger,
            ceiling,
            interval,
        }
    }

    /// Sweep on every interval tick until `shutdown`. The first sweep runs
    /// one interval after start.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            ceiling = self.ceiling,
            "Retry reconciler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report.attempted > 0 => {
                    tracing::info!(
                        attempted = report.attempted,
                        recovered = report.recovered,
                        failed = report.failed,
                        exhausted = report.exhausted,
                        skipped = report.skipped,
                        "Reconcile sweep finished"
                    );
                }
                Ok(_) => tracing::debug!("Reconcile sweep found nothing to retry"),
                Err(e) => tracing::error!(error = %e, "Reconcile sweep failed"),
            }
        }

        tracing::info!("Retry reconciler stopped");
    }

    /// Run a single pass over every unsent row below the ceiling.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let rows = self
            .ledger
            .list_unsent_below_retry_ceiling(self.ceiling)
            .await?;
        let mut report = SweepReport::default();

        for row in rows {
            report.attempted += 1;

            let result = match self.transport.send(&row.recipient, &row.body).await {
                Ok(()) => AttemptResult::Delivered,
                Err(e) => AttemptResult::Failed(e.to_string()),
            };

            let updated = match self.ledger.record_retry(row.id, &result, self.ceiling).await {
                Ok(Some(updated)) => updated,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(id = %row.id, error = %e, "Failed to record retry");
                    report.skipped += 1;
                    continue;
                }
            };

            if updated.sent {
                report.recovered += 1;
                tracing::info!(
                    recipient = %updated.recipient,
                    retry_count = updated.retry_count,
                    "Resent email"
                );
            } else if updated.is_permanently_failed(self.ceiling) {
                report.exhausted += 1;
                tracing::error!(
                    id = %updated.id,
                    recipient = %updated.recipient,
                    retry_count = updated.retry_count,
                    error = updated.error.as_deref().unwrap_or_default(),
                    "Email permanently failed"
                );
            } else {
                report.failed += 1;
                tracing::warn!(
                    recipient = %updated.recipient,
                    retry_count = updated.retry_count,
                    "Retry failed"
                );
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::testing::ScriptedTransport;

    async fn seed_failed(ledger: &InMemoryLedger, recipient: &str, body: &str) {
        ledger
            .upsert_by_recipient_and_body(recipient, body, &AttemptResult::Failed("down".into()))
            .await
            .unwrap();
    }

    fn reconciler(transport: Arc<ScriptedTransport>, ledger: Arc<InMemoryLedger>) -> RetryReconciler {
        RetryReconciler::new(transport, ledger, 3, Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_sweep_recovers_row() {
        let ledger = Arc::new(InMemoryLedger::new());
        seed_failed(&ledger, "a@example.com", "hi").await;
        let transport = Arc::new(ScriptedTransport::always_ok());

        let report = reconciler(transport.clone(), ledger.clone()).sweep().await.unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(report.recovered, 1);
        let row = ledger.find("a@example.com", "hi").await.unwrap().unwrap();
        assert!(row.sent);
        assert_eq!(row.error, None);
        assert_eq!(row.retry_count, 0);
        assert_eq!(transport.accepted().await, vec![("a@example.com".into(), "hi".into())]);
    }

    #[tokio::test]
    async fn test_sweeps_stop_at_ceiling() {
        let ledger = Arc::new(InMemoryLedger::new());
        seed_failed(&ledger, "a@example.com", "hi").await;
        let transport = Arc::new(ScriptedTransport::always_failing());
        let reconciler = reconciler(transport.clone(), ledger.clone());

        let first = reconciler.sweep().await.unwrap();
        let second = reconciler.sweep().await.unwrap();
        let third = reconciler.sweep().await.unwrap();
        let fourth = reconciler.sweep().await.unwrap();

        assert_eq!(first.failed, 1);
        assert_eq!(second.failed, 1);
        assert_eq!(third.exhausted, 1);
        assert_eq!(fourth, SweepReport::default());
        assert_eq!(transport.calls(), 3);

        let row = ledger.find("a@example.com", "hi").await.unwrap().unwrap();
        assert!(!row.sent);
        assert_eq!(row.retry_count, 3);
        assert!(row.error.is_some());
        assert_eq!(ledger.list_unsent().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sent_rows_are_not_retried() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .upsert_by_recipient_and_body("a@example.com", "hi", &AttemptResult::Delivered)
            .await
            .unwrap();
        let transport = Arc::new(ScriptedTransport::always_ok());

        let report = reconciler(transport.clone(), ledger).sweep().await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sweep_waits_one_interval() {
        let ledger = Arc::new(InMemoryLedger::new());
        seed_failed(&ledger, "a@example.com", "hi").await;
        let transport = Arc::new(ScriptedTransport::always_ok());
        let reconciler = Arc::new(reconciler(transport.clone(), ledger.clone()));
        let shutdown = CancellationToken::new();

        let task = {
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(transport.calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.calls(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
