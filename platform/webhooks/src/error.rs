use event_consumer::ConsumerError;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("outbox error: {0}")]
    Outbox(#[from] outbox::OutboxError),

    #[error("invalid webhook subscription: {0}")]
    InvalidSubscription(String),

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("unknown delivery job status: {0}")]
    UnknownJobStatus(String),
}

pub type WebhookResult<T> = Result<T, WebhookError>;

/// One failed delivery attempt at the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid webhook URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Retrying cannot fix a malformed URL; everything else may be transient
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::InvalidUrl { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_builder() {
            TransportError::InvalidUrl {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Receiver-side rejection; never retried by the sender's signature alone
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("webhook signature mismatch")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("idempotency store error: {0}")]
    Store(#[from] ConsumerError),
}
