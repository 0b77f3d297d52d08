//! # EventBus Abstraction
//!
//! Broker seam shared by the outbox publisher (producer side) and idempotent
//! consumers (consumer side).
//!
//! ## Delivery Contract
//!
//! Every implementation is **at-least-once**: a subscriber may observe the same
//! logical event more than once (broker redelivery, publisher retry after a crash
//! between publish and status update). Consumers must therefore route every
//! message through an idempotency guard before applying effects.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation backed by a NATS server
//! - **InMemoryBus**: Test/dev implementation with a publish journal and
//!   failure injection
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let mut stream = bus.subscribe("fleet.events.>").await?;
//! bus.publish("fleet.events.vehicle_type.created", b"{}".to_vec()).await?;
//!
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.subject);
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;

pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// A message received from the event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// Raw payload bytes (a JSON-encoded [`EventEnvelope`] for outbox traffic)
    pub payload: Vec<u8>,
    /// Broker headers, when the transport carries them
    pub headers: Option<HashMap<String, String>>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core broker abstraction for publish-subscribe messaging
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload to a subject.
    ///
    /// `Ok(())` means the broker accepted the message. It does not imply that any
    /// subscriber has processed it.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern.
    ///
    /// Patterns use NATS wildcards: `*` matches exactly one token, `>` matches one
    /// or more trailing tokens (`fleet.events.>`).
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Check whether `subject` matches a NATS-style subscription `pattern`.
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => continue,
            (literal, Some(actual)) if literal == actual => continue,
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

/// Reject subjects that cannot be published to (empty tokens or wildcards).
pub(crate) fn validate_publish_subject(subject: &str) -> BusResult<()> {
    let invalid = subject.is_empty()
        || subject
            .split('.')
            .any(|token| token.is_empty() || token == "*" || token == ">");

    if invalid {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
