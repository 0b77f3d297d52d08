use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Initialize a connection pool to the PostgreSQL database
///
/// # Connection Limits
/// - Production default: 10 connections
/// - Tests cap it through `DB_MAX_CONNECTIONS`
///
/// Every session gets `statement_timeout` from `DB_STATEMENT_TIMEOUT_MS`
/// (default 5000) so a stuck query cannot hold an outbox sweep forever.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = env_or("DB_MAX_CONNECTIONS", 10u32);
    let min_connections = env_or("DB_MIN_CONNECTIONS", 0u32);
    let acquire_timeout_secs = env_or("DB_ACQUIRE_TIMEOUT_SECS", 3u64);
    let statement_timeout_ms = env_or("DB_STATEMENT_TIMEOUT_MS", 5_000u64);

    let options = PgConnectOptions::from_str(database_url)?
        .options([("statement_timeout", statement_timeout_ms.to_string())]);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect_with(options)
        .await
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
