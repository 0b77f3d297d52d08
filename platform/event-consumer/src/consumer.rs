//! Guarded consumer loop
//!
//! Redelivery is part of the contract: a handler may run more than once for the
//! same logical event, so every consumer goes through a [`GuardStrategy`].

use async_trait::async_trait;
use chrono::Utc;
use event_bus::consumer_retry::{retry_with_backoff_when, RetryConfig};
use event_bus::{validate_envelope_fields, BusMessage, EventBus, EventEnvelope};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::error::{ConsumerError, ConsumerResult};
use crate::idempotency::IdempotencyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The effect was applied by this delivery
    Applied,
    /// Already applied by an earlier delivery; acknowledged without effect
    Duplicate,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (database hiccup, downstream timeout)
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help (invalid payload for this handler)
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        HandlerError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Permanent(e.to_string())
    }
}

impl From<ConsumerError> for HandlerError {
    fn from(e: ConsumerError) -> Self {
        match e {
            ConsumerError::MalformedEnvelope { .. } | ConsumerError::Serialization(_) => {
                HandlerError::Permanent(e.to_string())
            }
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

/// Applies the effect of one event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope<Value>) -> Result<ProcessOutcome, HandlerError>;
}

/// How duplicates are filtered before the effect runs
#[derive(Clone)]
pub enum GuardStrategy {
    /// Mark in the store first, then run the handler. A handler that exhausts
    /// its retries leaves the marker in place; the message is dead-lettered for
    /// manual replay.
    MarkFirst(Arc<dyn IdempotencyStore>),
    /// The handler marks with [`try_mark_processed_tx`](crate::try_mark_processed_tx)
    /// inside the transaction that applies the effect, and reports
    /// [`ProcessOutcome::Duplicate`] itself.
    Transactional,
}

pub struct IdempotentConsumer {
    name: String,
    handler: Arc<dyn EventHandler>,
    guard: GuardStrategy,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryConfig,
}

impl IdempotentConsumer {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        guard: GuardStrategy,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            guard,
            dead_letters,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process one delivered message
    ///
    /// Malformed envelopes and handler failures are dead-lettered and then
    /// returned as errors so callers can count them; the loop in [`run`](Self::run)
    /// only logs them.
    pub async fn process_message(&self, msg: &BusMessage) -> ConsumerResult<ProcessOutcome> {
        let envelope = match parse_envelope(msg) {
            Ok(envelope) => envelope,
            Err(reason) => {
                self.dead_letter(msg, None, &reason, 0).await;
                return Err(ConsumerError::MalformedEnvelope {
                    subject: msg.subject.clone(),
                    reason,
                });
            }
        };

        if let GuardStrategy::MarkFirst(store) = &self.guard {
            let marked = retry_with_backoff_when(
                || async {
                    store
                        .try_mark_processed(
                            &envelope.event_id.to_string(),
                            &envelope.event_type,
                            &envelope.payload,
                        )
                        .await
                },
                &self.retry,
                &self.name,
                |e| !matches!(e, ConsumerError::Serialization(_)),
            )
            .await;

            match marked {
                Ok(outcome) if outcome.already_processed => {
                    tracing::info!(event_id = %envelope.event_id, "Duplicate event skipped");
                    return Ok(ProcessOutcome::Duplicate);
                }
                Ok(_) => {}
                Err(e) => {
                    let error = format!("idempotency check failed: {e}");
                    self.dead_letter(msg, Some(&envelope), &error, self.retry.max_attempts)
                        .await;
                    return Err(ConsumerError::HandlerFailed {
                        event_id: envelope.event_id,
                        attempts: self.retry.max_attempts,
                        error,
                    });
                }
            }
        }

        let handled = retry_with_backoff_when(
            || self.handler.handle(&envelope),
            &self.retry,
            &self.name,
            HandlerError::is_transient,
        )
        .await;

        match handled {
            Ok(outcome) => {
                match outcome {
                    ProcessOutcome::Applied => tracing::info!(event_id = %envelope.event_id, "Event applied"),
                    ProcessOutcome::Duplicate => {
                        tracing::info!(event_id = %envelope.event_id, "Duplicate event skipped")
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                let attempts = if e.is_transient() { self.retry.max_attempts } else { 1 };
                tracing::error!(
                    event_id = %envelope.event_id,
                    attempts = attempts,
                    error = %e,
                    "Event processing failed, sending to DLQ"
                );
                self.dead_letter(msg, Some(&envelope), &e.to_string(), attempts).await;
                Err(ConsumerError::HandlerFailed {
                    event_id: envelope.event_id,
                    attempts,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Subscribe to `subject` and process messages until `shutdown` flips
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn EventBus>,
        subject: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerResult<()> {
        let mut stream = bus.subscribe(subject).await?;
        tracing::info!(consumer = %self.name, subject = %subject, "Consumer subscribed");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = stream.next() => {
                    let Some(msg) = next else {
                        tracing::warn!(consumer = %self.name, subject = %subject, "Subscription ended");
                        break;
                    };

                    let span = tracing::info_span!(
                        "consume_event",
                        consumer = %self.name,
                        subject = %msg.subject,
                    );
                    if let Err(e) = self.process_message(&msg).instrument(span).await {
                        tracing::warn!(consumer = %self.name, error = %e, "Message not applied");
                    }
                }
            }
        }

        tracing::info!(consumer = %self.name, "Consumer stopped");
        Ok(())
    }

    async fn dead_letter(
        &self,
        msg: &BusMessage,
        envelope: Option<&EventEnvelope<Value>>,
        error: &str,
        retry_count: u32,
    ) {
        let letter = DeadLetter {
            event_id: envelope.map(|e| e.event_id),
            subject: msg.subject.clone(),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.to_string(),
            retry_count: i32::try_from(retry_count).unwrap_or(i32::MAX),
            failed_at: Utc::now(),
        };

        if let Err(e) = self.dead_letters.dead_letter(letter).await {
            tracing::error!(
                consumer = %self.name,
                subject = %msg.subject,
                error = %error,
                dlq_error = %e,
                "Failed to write to DLQ - event may be lost!"
            );
        }
    }
}

fn parse_envelope(msg: &BusMessage) -> Result<EventEnvelope<Value>, String> {
    let raw: Value =
        serde_json::from_slice(&msg.payload).map_err(|e| format!("invalid JSON: {e}"))?;
    validate_envelope_fields(&raw)?;
    serde_json::from_value(raw).map_err(|e| format!("invalid envelope: {e}"))
}
