use event_bus::BusError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("malformed envelope on {subject}: {reason}")]
    MalformedEnvelope { subject: String, reason: String },

    #[error("handler failed for event {event_id} after {attempts} attempt(s): {error}")]
    HandlerFailed {
        event_id: Uuid,
        attempts: u32,
        error: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;
