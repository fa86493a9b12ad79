use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connect to PostgreSQL and bring the ledger and notification tables up to date.
///
/// `max_connections` should cover the worker pool plus the reconciler, since every
/// dispatch ends in exactly one ledger write.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "Connected to PostgreSQL");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}
