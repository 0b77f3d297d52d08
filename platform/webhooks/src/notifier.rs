//! Signed fan-out with per-subscriber retry

use chrono::Utc;
use event_bus::consumer_retry::RetryConfig;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::audit::{DeliveryLog, DeliveryStatus, WebhookDelivery, WebhookEventRecord};
use crate::error::{TransportError, WebhookResult};
use crate::payload::WebhookPayload;
use crate::signing;
use crate::subscriptions::{SubscriptionStore, WebhookSubscription};
use crate::transport::{WebhookRequest, WebhookResponse, WebhookTransport};

/// Response bodies are stored up to this many characters
pub const RESPONSE_EXCERPT_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Attempts per subscriber and the wait after each failed one
    pub retry: RetryConfig,
    /// Subscribers delivered to at the same time
    pub max_concurrency: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::new(3, Duration::from_secs(2), Duration::from_secs(60)),
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    /// Permanent failure; not retried
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberReport {
    pub subscription_id: Uuid,
    pub url: String,
    pub outcome: SubscriberOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub event: String,
    pub idempotency_key: String,
    pub subscribers: Vec<SubscriberReport>,
}

impl NotifyReport {
    pub fn outcome_for(&self, subscription_id: Uuid) -> Option<&SubscriberOutcome> {
        self.subscribers
            .iter()
            .find(|s| s.subscription_id == subscription_id)
            .map(|s| &s.outcome)
    }

    pub fn delivered(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|s| matches!(s.outcome, SubscriberOutcome::Delivered { .. }))
            .count()
    }
}

/// Result of one POST to one subscriber, already written to the audit log
pub(crate) enum AttemptResult {
    Delivered,
    Retryable(String),
    Permanent(String),
}

pub struct WebhookNotifier {
    subscriptions: Arc<dyn SubscriptionStore>,
    transport: Arc<dyn WebhookTransport>,
    log: Arc<dyn DeliveryLog>,
    config: NotifierConfig,
}

impl WebhookNotifier {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn WebhookTransport>,
        log: Arc<dyn DeliveryLog>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            subscriptions,
            transport,
            log,
            config,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Deliver `payload` to every active subscription for its event type
    ///
    /// The event is logged even when nobody is subscribed. Per-subscriber
    /// failures are reported, not returned as errors.
    pub async fn notify(&self, payload: &WebhookPayload) -> WebhookResult<NotifyReport> {
        let body = payload.to_bytes()?;

        if let Err(e) = self.log_event(payload).await {
            tracing::error!(
                event_id = %payload.id,
                idempotency_key = %payload.idempotency_key,
                error = %e,
                "Failed to log webhook event"
            );
        }

        let subscriptions = self.active_subscriptions(&payload.event).await?;

        let subscribers = stream::iter(subscriptions)
            .map(|subscription| {
                let body = &body;
                async move {
                    let outcome = self.deliver(&subscription, payload, body).await;
                    SubscriberReport {
                        subscription_id: subscription.id,
                        url: subscription.url,
                        outcome,
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        Ok(NotifyReport {
            event: payload.event.clone(),
            idempotency_key: payload.idempotency_key.clone(),
            subscribers,
        })
    }

    pub(crate) async fn log_event(&self, payload: &WebhookPayload) -> WebhookResult<()> {
        let record = WebhookEventRecord::from_payload(payload)?;
        self.log.record_event(&record).await
    }

    pub(crate) async fn active_subscriptions(&self, event_type: &str) -> WebhookResult<Vec<WebhookSubscription>> {
        let subscriptions = self.subscriptions.find_active_by_event_type(event_type).await?;
        if subscriptions.is_empty() {
            tracing::info!(event_type = %event_type, "No active webhook subscriptions");
        }
        Ok(subscriptions)
    }

    pub(crate) async fn subscription(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>> {
        self.subscriptions.find(id).await
    }

    /// Validate the subscription and sign `body` for it
    pub(crate) fn prepare(
        &self,
        subscription: &WebhookSubscription,
        payload: &WebhookPayload,
        body: &[u8],
    ) -> Result<WebhookRequest, String> {
        validate_url(&subscription.url)?;
        let signature = signing::sign(&subscription.secret, body)
            .map_err(|e| format!("cannot sign with subscription secret: {e}"))?;

        Ok(WebhookRequest {
            url: subscription.url.clone(),
            body: body.to_vec(),
            signature,
            event_type: payload.event.clone(),
            idempotency_key: payload.idempotency_key.clone(),
        })
    }

    /// Audit a subscription that cannot be delivered to at all
    pub(crate) async fn reject(
        &self,
        subscription: &WebhookSubscription,
        payload: &WebhookPayload,
        attempt: u32,
        reason: &str,
    ) {
        self.record_attempt(subscription, payload, attempt, None, Some(reason.to_string()))
            .await;
        tracing::error!(
            subscription_id = %subscription.id,
            url = %subscription.url,
            reason = %reason,
            "Webhook subscription rejected"
        );
    }

    /// Send once and append the attempt to the audit log
    pub(crate) async fn attempt(
        &self,
        subscription: &WebhookSubscription,
        payload: &WebhookPayload,
        request: &WebhookRequest,
        attempt: u32,
    ) -> AttemptResult {
        match self.transport.send(request).await {
            Ok(response) if response.is_success() => {
                self.record_attempt(subscription, payload, attempt, Some(&response), None)
                    .await;
                tracing::info!(
                    subscription_id = %subscription.id,
                    event_id = %payload.id,
                    attempt = attempt,
                    status = response.status,
                    "Webhook delivered"
                );
                AttemptResult::Delivered
            }
            Ok(response) => {
                let error = format!("HTTP {}", response.status);
                self.record_attempt(subscription, payload, attempt, Some(&response), Some(error.clone()))
                    .await;
                AttemptResult::Retryable(error)
            }
            Err(e) => {
                self.record_attempt(subscription, payload, attempt, None, Some(e.to_string()))
                    .await;
                classify(e)
            }
        }
    }

    async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        payload: &WebhookPayload,
        body: &[u8],
    ) -> SubscriberOutcome {
        let request = match self.prepare(subscription, payload, body) {
            Ok(request) => request,
            Err(reason) => {
                self.reject(subscription, payload, 1, &reason).await;
                return SubscriberOutcome::Rejected { reason };
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            match self.attempt(subscription, payload, &request, attempt).await {
                AttemptResult::Delivered => return SubscriberOutcome::Delivered { attempts: attempt },
                AttemptResult::Permanent(reason) => {
                    tracing::error!(
                        subscription_id = %subscription.id,
                        event_id = %payload.id,
                        reason = %reason,
                        "Webhook delivery failed permanently"
                    );
                    return SubscriberOutcome::Rejected { reason };
                }
                AttemptResult::Retryable(last_error) if !self.config.retry.has_attempts_left(attempt) => {
                    tracing::error!(
                        subscription_id = %subscription.id,
                        event_id = %payload.id,
                        attempts = attempt,
                        error = %last_error,
                        "Webhook delivery exhausted retries"
                    );
                    return SubscriberOutcome::Exhausted {
                        attempts: attempt,
                        last_error,
                    };
                }
                AttemptResult::Retryable(last_error) => {
                    let backoff = self.config.retry.backoff_for(attempt);
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        event_id = %payload.id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %last_error,
                        "Webhook delivery failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    async fn record_attempt(
        &self,
        subscription: &WebhookSubscription,
        payload: &WebhookPayload,
        attempt: u32,
        response: Option<&WebhookResponse>,
        error: Option<String>,
    ) {
        let succeeded = error.is_none();
        let now = Utc::now();
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            event_id: payload.id,
            subscription_id: subscription.id,
            attempt_number: i32::try_from(attempt).unwrap_or(i32::MAX),
            status: if succeeded {
                DeliveryStatus::Success
            } else {
                DeliveryStatus::Failed
            },
            response_status: response.map(|r| i32::from(r.status)),
            response_body_excerpt: response.map(|r| excerpt(&r.body)),
            error_message: error,
            delivered_at: succeeded.then_some(now),
            created_at: now,
        };

        if let Err(e) = self.log.append(&delivery).await {
            tracing::error!(
                subscription_id = %subscription.id,
                event_id = %payload.id,
                attempt = attempt,
                error = %e,
                "Failed to append webhook delivery to audit log"
            );
        }
    }
}

fn classify(error: TransportError) -> AttemptResult {
    if error.is_permanent() {
        AttemptResult::Permanent(error.to_string())
    } else {
        AttemptResult::Retryable(error.to_string())
    }
}

fn validate_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL {url}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        "http" | "https" => Err(format!("invalid URL {url}: missing host")),
        scheme => Err(format!("invalid URL {url}: unsupported scheme {scheme}")),
    }
}

/// First [`RESPONSE_EXCERPT_LIMIT`] characters, cut on a char boundary
fn excerpt(body: &str) -> String {
    body.chars().take(RESPONSE_EXCERPT_LIMIT).collect()
}
