use redis::Client;
use redis::aio::ConnectionManager;

/// Open the Redis client backing the message channel.
///
/// The returned `ConnectionManager` is shared by publishers; subscriptions open
/// their own connections because blocking stream reads would stall a shared one.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<(Client, ConnectionManager)> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client.clone()).await?;

    tracing::info!("Connected to Redis");
    Ok((client, manager))
}
