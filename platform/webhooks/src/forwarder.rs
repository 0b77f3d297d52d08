//! Outbox ledger → durable webhook delivery

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use outbox::OutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;

use crate::error::WebhookResult;
use crate::notifier::{AttemptResult, WebhookNotifier};
use crate::payload::{WebhookMetadata, WebhookPayload};
use crate::queue::{DeliveryJob, DeliveryQueue, JobStatus};

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// How often the ledger and the job queue are swept
    pub poll_interval: Duration,
    /// Outbox rows handed off per sweep
    pub batch_size: i64,
    /// Jobs attempted per sweep
    pub job_batch_size: i64,
    /// A claimed job is due again after this long if its attempt never reports back.
    /// Must exceed the transport timeout.
    pub claim_lease: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            job_batch_size: 100,
            claim_lease: Duration::from_secs(60),
        }
    }
}

/// What one delivery sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverReport {
    pub delivered: usize,
    /// Failed this time, next attempt scheduled
    pub retrying: usize,
    pub exhausted: usize,
    pub rejected: usize,
    pub abandoned: usize,
}

enum JobOutcome {
    Delivered,
    Retrying,
    Final(JobStatus),
}

impl DeliverReport {
    fn absorb(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Delivered => self.delivered += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::Final(JobStatus::Exhausted) => self.exhausted += 1,
            JobOutcome::Final(JobStatus::Rejected) => self.rejected += 1,
            JobOutcome::Final(_) => self.abandoned += 1,
        }
    }
}

/// Turns every committed outbox row into signed webhook deliveries
///
/// Work lives in the database at every step. A row is handed off by logging
/// its event and queueing one [`DeliveryJob`] per active subscription before
/// the row is marked forwarded. Jobs are attempted once per sweep; a failure
/// reschedules the job with the notifier's backoff instead of sleeping, so a
/// restart resumes where the last run stopped and one dead subscriber never
/// delays another subscriber or a later event.
///
/// Delivery results never flow back to the outbox row status.
pub struct WebhookForwarder {
    outbox: Arc<dyn OutboxStore>,
    queue: Arc<dyn DeliveryQueue>,
    notifier: Arc<WebhookNotifier>,
    version: String,
    metadata: WebhookMetadata,
    config: ForwarderConfig,
}

impl WebhookForwarder {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        queue: Arc<dyn DeliveryQueue>,
        notifier: Arc<WebhookNotifier>,
        version: impl Into<String>,
        metadata: WebhookMetadata,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            outbox,
            queue,
            notifier,
            version: version.into(),
            metadata,
            config,
        }
    }

    /// Hand unforwarded outbox rows to the delivery queue, oldest first
    ///
    /// Returns the number of rows marked forwarded. A crash between queueing
    /// and marking repeats the handoff on the next sweep; jobs already queued
    /// for that event are kept as they are.
    pub async fn forward_pending(&self) -> WebhookResult<usize> {
        let events = self.outbox.fetch_unforwarded(self.config.batch_size).await?;
        let mut forwarded = 0;

        for event in &events {
            let payload = WebhookPayload::from_outbox_event(event, &self.version, self.metadata.clone());
            self.notifier.log_event(&payload).await?;

            let now = Utc::now();
            let subscriptions = self.notifier.active_subscriptions(&payload.event).await?;
            for subscription in &subscriptions {
                self.queue
                    .enqueue(&DeliveryJob::new(&payload, subscription.id, now))
                    .await?;
            }

            if self.outbox.mark_forwarded(event.id, now).await? {
                forwarded += 1;
            }
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                subscribers = subscriptions.len(),
                "Queued webhook deliveries"
            );
        }

        Ok(forwarded)
    }

    /// Attempt every job due at `now` once, concurrently up to the notifier's limit
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> WebhookResult<DeliverReport> {
        let lease_until = after(now, self.config.claim_lease);
        let jobs = self
            .queue
            .claim_due(now, lease_until, self.config.job_batch_size)
            .await?;

        let outcomes = stream::iter(jobs)
            .map(|job| {
                let span = tracing::info_span!(
                    "webhook_job",
                    job_id = %job.id,
                    event_id = %job.event_id,
                    subscription_id = %job.subscription_id
                );
                self.attempt(job, now).instrument(span)
            })
            .buffer_unordered(self.notifier.config().max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = DeliverReport::default();
        for outcome in outcomes {
            report.absorb(outcome?);
        }
        Ok(report)
    }

    async fn attempt(&self, job: DeliveryJob, now: DateTime<Utc>) -> WebhookResult<JobOutcome> {
        let attempt = u32::try_from(job.attempts).unwrap_or(0) + 1;
        let attempts = i32::try_from(attempt).unwrap_or(i32::MAX);

        let subscription = match self.notifier.subscription(job.subscription_id).await? {
            Some(subscription) if subscription.is_active => subscription,
            _ => {
                tracing::info!("Abandoning webhook delivery; subscription is no longer active");
                self.queue
                    .finish(job.id, JobStatus::Abandoned, job.attempts, Some("subscription is no longer active"))
                    .await?;
                return Ok(JobOutcome::Final(JobStatus::Abandoned));
            }
        };

        let body = job.payload.to_bytes()?;
        let request = match self.notifier.prepare(&subscription, &job.payload, &body) {
            Ok(request) => request,
            Err(reason) => {
                self.notifier.reject(&subscription, &job.payload, attempt, &reason).await;
                self.queue
                    .finish(job.id, JobStatus::Rejected, attempts, Some(&reason))
                    .await?;
                return Ok(JobOutcome::Final(JobStatus::Rejected));
            }
        };

        let retry = &self.notifier.config().retry;
        match self.notifier.attempt(&subscription, &job.payload, &request, attempt).await {
            AttemptResult::Delivered => {
                self.queue.finish(job.id, JobStatus::Delivered, attempts, None).await?;
                Ok(JobOutcome::Delivered)
            }
            AttemptResult::Permanent(reason) => {
                tracing::error!(reason = %reason, "Webhook delivery failed permanently");
                self.queue
                    .finish(job.id, JobStatus::Rejected, attempts, Some(&reason))
                    .await?;
                Ok(JobOutcome::Final(JobStatus::Rejected))
            }
            AttemptResult::Retryable(error) if !retry.has_attempts_left(attempt) => {
                tracing::error!(attempts = attempt, error = %error, "Webhook delivery exhausted retries");
                self.queue
                    .finish(job.id, JobStatus::Exhausted, attempts, Some(&error))
                    .await?;
                Ok(JobOutcome::Final(JobStatus::Exhausted))
            }
            AttemptResult::Retryable(error) => {
                let backoff = retry.backoff_for(attempt);
                tracing::warn!(
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Webhook delivery failed, rescheduled"
                );
                self.queue
                    .reschedule(job.id, attempts, after(now, backoff), &error)
                    .await?;
                Ok(JobOutcome::Retrying)
            }
        }
    }

    /// Sweep every `poll_interval` until `shutdown` flips to `true` (or its sender is dropped)
    ///
    /// Shutdown is observed between sweeps; whatever is still pending stays in
    /// the ledger and the job queue for the next run.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting webhook forwarder"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }

        tracing::info!("Webhook forwarder stopped");
    }

    async fn sweep(&self) {
        if let Err(e) = self.forward_pending().await {
            tracing::error!(error = %e, "Webhook handoff failed");
        }

        match self.deliver_due(Utc::now()).await {
            Ok(report) if report != DeliverReport::default() => tracing::info!(
                delivered = report.delivered,
                retrying = report.retrying,
                exhausted = report.exhausted,
                rejected = report.rejected,
                abandoned = report.abandoned,
                "Webhook delivery sweep complete"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Webhook delivery sweep failed"),
        }
    }
}

/// `now + wait`, saturating at the latest representable instant
fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
