/// Errors raised by the outbox ledger, store, and publisher
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid outbox event: {0}")]
    Validation(String),

    #[error("unknown outbox status: {0}")]
    InvalidStatus(String),

    #[error("outbox store unavailable: {0}")]
    Unavailable(String),
}

pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors raised by a change-notification channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("change channel closed")]
    Closed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;
