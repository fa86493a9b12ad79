use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_notifier::backoff::BackoffSchedule;
use courier_notifier::channel::{ConsumerPolicy, RedisChannelOptions, RedisStreamChannel};
use courier_notifier::ledger::{FailedMessageLedger, PgLedger};
use courier_notifier::reconciler::RetryReconciler;
use courier_notifier::transport::{MailTransport, ResendTransport};
use courier_notifier::worker::DeliveryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_worker=info,courier_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    let (client, publisher) = redis_pool::create_redis_pool(&config.redis_url).await?;
    let channel = RedisStreamChannel::new(client, publisher, RedisChannelOptions::from_config(&config));

    let transport: Arc<dyn MailTransport> = Arc::new(ResendTransport::from_config(&config)?);
    let ledger: Arc<dyn FailedMessageLedger> = Arc::new(PgLedger::new(pool));

    let shutdown = CancellationToken::new();

    let worker = DeliveryWorker::new(
        transport.clone(),
        ledger.clone(),
        BackoffSchedule::new(config.delivery_backoff(), config.delivery_max_attempts),
        config.worker_pool_size,
        shutdown.clone(),
    )
    .with_max_pending(config.worker_max_pending);
    let reconciler = RetryReconciler::new(
        transport,
        ledger,
        config.retry_ceiling,
        config.reconcile_interval(),
    );
    let policy = ConsumerPolicy::default().with_max_retries(config.consumer_max_retries);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping gracefully...");
            }
            shutdown.cancel();
        }
    });

    // The reconciler stops with the worker, whichever way the worker ends.
    let delivery = async {
        let result = worker.run(&channel, policy).await;
        shutdown.cancel();
        result
    };
    let (worker_result, ()) = tokio::join!(delivery, reconciler.run(shutdown.clone()));

    if let Err(e) = worker_result {
        tracing::error!(error = %e, "Delivery worker exited with error");
        return Err(e.into());
    }

    tracing::info!("Courier worker stopped.");
    Ok(())
}
