use std::env;
use std::time::Duration;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: String,
    pub nats_url: String,
    pub host: String,
    pub port: u16,
    /// Outbox subjects are `{subject_prefix}.{event_type}`
    pub subject_prefix: String,
    pub outbox_sweep_interval: Duration,
    pub outbox_retry_interval: Duration,
    pub outbox_batch_size: i64,
    pub outbox_max_retries: i32,
    pub publish_timeout: Duration,
    pub webhooks_enabled: bool,
    pub webhook_version: String,
    pub webhook_source: String,
    pub webhook_environment: String,
    pub webhook_timeout: Duration,
    pub webhook_max_concurrency: usize,
    /// How often the webhook forwarder sweeps the outbox and its job queue
    pub webhook_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus_type = env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string());

        let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8101".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let subject_prefix = env::var("OUTBOX_SUBJECT_PREFIX").unwrap_or_else(|_| "fleet".to_string());

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            host,
            port,
            subject_prefix,
            outbox_sweep_interval: Duration::from_millis(parse_var("OUTBOX_SWEEP_INTERVAL_MS", 5_000)?),
            outbox_retry_interval: Duration::from_millis(parse_var("OUTBOX_RETRY_INTERVAL_MS", 30_000)?),
            outbox_batch_size: parse_var("OUTBOX_BATCH_SIZE", 100)?,
            outbox_max_retries: parse_var("OUTBOX_MAX_RETRIES", 3)?,
            publish_timeout: Duration::from_secs(parse_var("OUTBOX_PUBLISH_TIMEOUT_SECS", 5)?),
            webhooks_enabled: parse_var("WEBHOOKS_ENABLED", true)?,
            webhook_version: env::var("WEBHOOK_VERSION").unwrap_or_else(|_| "1.0".to_string()),
            webhook_source: env::var("WEBHOOK_SOURCE").unwrap_or_else(|_| "vehicle-types".to_string()),
            webhook_environment: env::var("WEBHOOK_ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            webhook_timeout: Duration::from_secs(parse_var("WEBHOOK_TIMEOUT_SECS", 10)?),
            webhook_max_concurrency: parse_var("WEBHOOK_MAX_CONCURRENCY", 8)?,
            webhook_poll_interval: Duration::from_millis(parse_var("WEBHOOK_POLL_INTERVAL_MS", 1_000)?),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}
