use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string (backs the message channel)
    pub redis_url: String,

    /// Port the API server binds to (default: 3000)
    pub api_port: u16,

    /// Key prefix for channel streams, e.g. `courier` → `courier:email_notifications:0`
    pub channel_stream_prefix: String,

    /// Stable consumer name so a restarted process reclaims its pending records
    pub channel_consumer_name: String,

    /// How long a channel read blocks waiting for new records, in milliseconds
    pub channel_block_ms: u64,

    /// Approximate upper bound on the length of each partition stream
    pub channel_stream_max_len: usize,

    /// Partition count of the email topic (default: 3)
    pub email_topic_partitions: usize,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Resend API endpoint
    pub resend_api_url: String,

    /// Email sender address
    pub email_from: Option<String>,

    /// Subject line of outgoing notification emails
    pub email_subject: String,

    /// Maximum number of concurrent mail gateway calls
    pub worker_pool_size: usize,

    /// Dispatches, backed-off ones included, held before the consumer pauses
    pub worker_max_pending: usize,

    /// Attempts made by the delivery worker for one dispatch (default: 3)
    pub delivery_max_attempts: u32,

    /// Backoff schedule between delivery attempts, in seconds (default: 60,300,900)
    pub delivery_backoff_secs: Vec<u64>,

    /// Interval between reconciliation sweeps, in seconds (default: 120)
    pub reconcile_interval_secs: u64,

    /// Reconciler attempts after which a ledger row is left permanently unsent
    pub retry_ceiling: u32,

    /// Retries the consumer loop gives a failing handler before confirming the record
    pub consumer_max_retries: u32,

    /// Bulk recipient list read by `POST /notify/emails`
    pub recipients_file: String,

    /// Message body used for bulk sends when the request doesn't carry one
    pub bulk_message: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_max_connections: 20,
            redis_url: "redis://localhost:6379".to_string(),
            api_port: 3000,
            channel_stream_prefix: "courier".to_string(),
            channel_consumer_name: "courier-1".to_string(),
            channel_block_ms: 5_000,
            channel_stream_max_len: 100_000,
            email_topic_partitions: 3,
            resend_api_key: None,
            resend_api_url: "https://api.resend.com/emails".to_string(),
            email_from: None,
            email_subject: "Notification".to_string(),
            worker_pool_size: 8,
            worker_max_pending: 1024,
            delivery_max_attempts: 3,
            delivery_backoff_secs: vec![60, 300, 900],
            reconcile_interval_secs: 120,
            retry_ceiling: 3,
            consumer_max_retries: 3,
            recipients_file: "users.csv".to_string(),
            bulk_message: "Hello from the notification service!".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            api_port: parse_var("API_PORT", defaults.api_port)?,
            channel_stream_prefix: std::env::var("CHANNEL_STREAM_PREFIX")
                .unwrap_or(defaults.channel_stream_prefix),
            channel_consumer_name: std::env::var("CHANNEL_CONSUMER_NAME")
                .unwrap_or(defaults.channel_consumer_name),
            channel_block_ms: parse_var("CHANNEL_BLOCK_MS", defaults.channel_block_ms)?,
            channel_stream_max_len: parse_var(
                "CHANNEL_STREAM_MAX_LEN",
                defaults.channel_stream_max_len,
            )?,
            email_topic_partitions: parse_var(
                "EMAIL_TOPIC_PARTITIONS",
                defaults.email_topic_partitions,
            )?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_api_url: std::env::var("RESEND_API_URL").unwrap_or(defaults.resend_api_url),
            email_from: std::env::var("EMAIL_FROM").ok(),
            email_subject: std::env::var("EMAIL_SUBJECT").unwrap_or(defaults.email_subject),
            worker_pool_size: parse_var("WORKER_POOL_SIZE", defaults.worker_pool_size)?,
            worker_max_pending: parse_var("WORKER_MAX_PENDING", defaults.worker_max_pending)?,
            delivery_max_attempts: parse_var(
                "DELIVERY_MAX_ATTEMPTS",
                defaults.delivery_max_attempts,
            )?,
            delivery_backoff_secs: match std::env::var("DELIVERY_BACKOFF_SECS") {
                Ok(raw) => parse_secs_list(&raw)?,
                Err(_) => defaults.delivery_backoff_secs,
            },
            reconcile_interval_secs: parse_var(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            )?,
            retry_ceiling: parse_var("RETRY_CEILING", defaults.retry_ceiling)?,
            consumer_max_retries: parse_var(
                "CONSUMER_MAX_RETRIES",
                defaults.consumer_max_retries,
            )?,
            recipients_file: std::env::var("RECIPIENTS_FILE").unwrap_or(defaults.recipients_file),
            bulk_message: std::env::var("BULK_MESSAGE").unwrap_or(defaults.bulk_message),
        })
    }

    /// Backoff schedule as durations.
    pub fn delivery_backoff(&self) -> Vec<Duration> {
        self.delivery_backoff_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Read and parse an optional environment variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated list of seconds, e.g. `60,300,900`.
fn parse_secs_list(raw: &str) -> anyhow::Result<Vec<u64>> {
    let secs = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| anyhow::anyhow!("DELIVERY_BACKOFF_SECS entry '{}' is not a valid u64", s))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if secs.is_empty() {
        anyhow::bail!("DELIVERY_BACKOFF_SECS must list at least one delay");
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_delivery_policy() {
        let config = AppConfig::default();
        assert_eq!(config.delivery_max_attempts, 3);
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.email_topic_partitions, 3);
        assert_eq!(
            config.delivery_backoff(),
            vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900)
            ]
        );
        assert_eq!(config.reconcile_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_secs_list() {
        assert_eq!(parse_secs_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_secs_list("1,x").is_err());
        assert!(parse_secs_list(" , ").is_err());
    }
}
