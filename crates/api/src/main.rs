//! Courier API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::create_pool;
use courier_common::redis_pool::create_redis_pool;
use courier_notifier::channel::{ConsumerPolicy, RedisChannelOptions, RedisStreamChannel};
use courier_notifier::ledger::PgLedger;
use courier_notifier::store::PgNotificationStore;

use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    let (client, publisher) = create_redis_pool(&config.redis_url).await?;
    let channel = Arc::new(RedisStreamChannel::new(
        client,
        publisher,
        RedisChannelOptions::from_config(&config),
    ));

    let policy = ConsumerPolicy::default().with_max_retries(config.consumer_max_retries);
    let port = config.api_port;
    let state = AppState::new(
        config,
        channel.clone(),
        Arc::new(PgNotificationStore::new(pool.clone())),
        Arc::new(PgLedger::new(pool)),
    );

    // Push sessions live in this process, so the in-app and ack consumers do too.
    let shutdown = CancellationToken::new();
    let gateway = state.spawn_gateway(channel, policy, shutdown.clone());

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received shutdown signal, stopping gracefully...");
                    }
                    _ = shutdown.cancelled() => {}
                }
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    gateway.await??;

    tracing::info!("Courier API server stopped.");
    Ok(())
}
