//! # Webhooks
//!
//! Delivers internal events to third-party HTTP endpoints.
//!
//! For each event the [`WebhookNotifier`] logs the payload, looks up the active
//! subscriptions for its type, signs the serialized body once per subscriber
//! (hex HMAC-SHA256 in `X-Webhook-Signature`), and delivers to all subscribers
//! concurrently. Each subscriber gets up to three attempts with exponential
//! backoff, and every attempt is appended to the [`DeliveryLog`] before the
//! retry decision is made.
//!
//! The [`WebhookForwarder`] applies the same rules to the service's outbox
//! ledger: each committed row becomes one durable
//! [`DeliveryJob`] per subscriber in a [`DeliveryQueue`], attempted once per
//! sweep and rescheduled on failure, so pending deliveries survive restarts.
//! [`receiver::accept_webhook`] is the matching verification path for services
//! that receive these webhooks.

mod audit;
mod error;
mod forwarder;
mod notifier;
mod payload;
mod queue;
pub mod receiver;
pub mod signing;
mod subscriptions;
mod transport;

pub use audit::{
    DeliveryLog, DeliveryStatus, InMemoryDeliveryLog, PgDeliveryLog, WebhookDelivery, WebhookEventRecord,
};
pub use error::{TransportError, VerificationError, WebhookError, WebhookResult};
pub use forwarder::{DeliverReport, ForwarderConfig, WebhookForwarder};
pub use notifier::{
    NotifierConfig, NotifyReport, SubscriberOutcome, SubscriberReport, WebhookNotifier,
    RESPONSE_EXCERPT_LIMIT,
};
pub use payload::{idempotency_key_for, WebhookMetadata, WebhookPayload};
pub use queue::{DeliveryJob, DeliveryQueue, InMemoryDeliveryQueue, JobStatus, PgDeliveryQueue};
pub use subscriptions::{InMemorySubscriptionStore, PgSubscriptionStore, SubscriptionStore, WebhookSubscription};
pub use transport::{
    ReqwestTransport, WebhookRequest, WebhookResponse, WebhookTransport, HEADER_EVENT_TYPE,
    HEADER_IDEMPOTENCY_KEY, HEADER_SIGNATURE, MAX_RESPONSE_BYTES,
};
