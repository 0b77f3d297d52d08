//! Outbox publisher: moves committed rows from the ledger to the event bus

use chrono::Utc;
use event_bus::{EventBus, EventEnvelope};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::channel::ChangeChannel;
use crate::error::OutboxResult;
use crate::ledger::OutboxStore;
use crate::models::{OutboxEvent, OutboxStatus};

/// Publisher tuning. Defaults match the production services.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Subjects are `{subject_prefix}.{event_type}`
    pub subject_prefix: String,
    pub source_module: String,
    pub source_version: String,
    /// Rows per pending sweep
    pub batch_size: i64,
    /// Rows per retry sweep
    pub retry_batch_size: i64,
    pub sweep_interval: Duration,
    pub retry_interval: Duration,
    /// A FAILED row is re-queued only while `retry_count` is below this
    pub max_retries: i32,
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "events".to_string(),
            source_module: "unknown".to_string(),
            source_version: "0.0.0".to_string(),
            batch_size: 100,
            retry_batch_size: 50,
            sweep_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(30),
            max_retries: 3,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
    /// Rows left PENDING behind an older unpublished row of their aggregate
    pub held: usize,
}

impl PublishReport {
    fn absorb(&mut self, published: bool) {
        if published {
            self.published += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// FAILED rows moved back to PENDING
    pub requeued: usize,
    pub published: usize,
    pub failed: usize,
    /// Rows at the retry ceiling; they stay FAILED until an operator intervenes
    pub exhausted: Vec<Uuid>,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn subject_for(&self, event_type: &str) -> String {
        format!("{}.{}", self.config.subject_prefix, event_type)
    }

    /// Publish up to `batch_size` PENDING rows, oldest first
    ///
    /// A broker failure marks that row FAILED and holds back the later rows of
    /// the same aggregate until the retry sweep has published it; other
    /// aggregates carry on. Aggregates that already have a FAILED row below the
    /// retry ceiling are held from the start. A ledger failure aborts the sweep
    /// so nothing is published past a row whose status could not be recorded.
    pub async fn publish_pending(&self, batch_size: i64) -> OutboxResult<PublishReport> {
        let events = self.store.fetch_pending(batch_size).await?;
        if events.is_empty() {
            return Ok(PublishReport::default());
        }

        let mut held = self.retrying_aggregates().await?;
        let report = self.publish_in_order(&events, &mut held).await?;

        tracing::info!(
            published = report.published,
            failed = report.failed,
            held = report.held,
            "Outbox sweep complete"
        );

        Ok(report)
    }

    /// Fast path for a change notification
    ///
    /// Publishes the signalled row together with every PENDING row of the same
    /// aggregate, oldest first, so a notification can never overtake an earlier
    /// event of that aggregate. Nothing is published while the aggregate has a
    /// FAILED row waiting for the retry sweep. A row that is no longer PENDING
    /// is a no-op.
    pub async fn publish_event_id(&self, event_id: Uuid) -> OutboxResult<PublishReport> {
        let Some(signalled) = self.store.get(event_id).await? else {
            tracing::debug!(event_id = %event_id, "Signalled event not visible yet; sweep will cover it");
            return Ok(PublishReport::default());
        };
        if signalled.status != OutboxStatus::Pending {
            return Ok(PublishReport::default());
        }

        let events = self
            .store
            .fetch_pending_for_aggregate(
                &signalled.aggregate_type,
                &signalled.aggregate_id,
                self.config.batch_size,
            )
            .await?;

        let mut held = self.retrying_aggregates().await?;
        self.publish_in_order(&events, &mut held).await
    }

    /// Re-queue FAILED rows below the retry ceiling and publish them again
    ///
    /// Rows are retried oldest first. When a retry fails again, younger FAILED
    /// rows of that aggregate wait for the next pass.
    pub async fn retry_failed_events(&self) -> OutboxResult<RetryReport> {
        let events = self.store.fetch_failed(self.config.retry_batch_size).await?;
        let mut report = RetryReport::default();
        let mut held = HashSet::new();

        for event in events {
            if event.retry_count >= self.config.max_retries {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    retry_count = event.retry_count,
                    error = event.error_message.as_deref().unwrap_or(""),
                    "Outbox event exhausted retries; manual intervention required"
                );
                report.exhausted.push(event.id);
                continue;
            }

            let key = aggregate_key(&event);
            if held.contains(&key) {
                continue;
            }

            if !self.store.reset_to_pending(event.id).await? {
                continue;
            }
            report.requeued += 1;

            let requeued = OutboxEvent {
                status: OutboxStatus::Pending,
                ..event
            };
            if self.publish_row(&requeued).await? {
                report.published += 1;
            } else {
                report.failed += 1;
                held.insert(key);
            }
        }

        if report.requeued > 0 || !report.exhausted.is_empty() {
            tracing::info!(
                requeued = report.requeued,
                published = report.published,
                failed = report.failed,
                exhausted = report.exhausted.len(),
                "Outbox retry sweep complete"
            );
        }

        Ok(report)
    }

    /// Aggregates with a FAILED row still below the retry ceiling
    async fn retrying_aggregates(&self) -> OutboxResult<HashSet<(String, String)>> {
        let aggregates = self
            .store
            .fetch_retrying_aggregates(self.config.max_retries)
            .await?;
        Ok(aggregates.into_iter().collect())
    }

    /// Publish `events` in order, skipping every row of a held aggregate
    ///
    /// An aggregate becomes held as soon as one of its rows fails to publish.
    async fn publish_in_order(
        &self,
        events: &[OutboxEvent],
        held: &mut HashSet<(String, String)>,
    ) -> OutboxResult<PublishReport> {
        let mut report = PublishReport::default();

        for event in events {
            let key = aggregate_key(event);
            if held.contains(&key) {
                report.held += 1;
                continue;
            }

            let published = self.publish_row(event).await?;
            if !published {
                held.insert(key);
            }
            report.absorb(published);
        }

        Ok(report)
    }

    /// Publish one PENDING row and record the result. Returns whether it was published.
    async fn publish_row(&self, event: &OutboxEvent) -> OutboxResult<bool> {
        let subject = self.subject_for(&event.event_type);
        let envelope = EventEnvelope::new(
            event.event_type.clone(),
            event.aggregate_type.clone(),
            event.aggregate_id.clone(),
            &event.payload,
        )
        .with_event_id(event.id)
        .with_occurred_at(event.created_at)
        .with_source(&self.config.source_module, &self.config.source_version);
        let bytes = serde_json::to_vec(&envelope)?;

        let outcome = match timeout(self.config.publish_timeout, self.bus.publish(&subject, bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "publish timed out after {}ms",
                self.config.publish_timeout.as_millis()
            )),
        };

        match outcome {
            Ok(()) => {
                self.store.mark_published(event.id, Utc::now()).await?;
                tracing::debug!(
                    event_id = %event.id,
                    subject = %subject,
                    "Published outbox event"
                );
                Ok(true)
            }
            Err(error) => {
                self.store.mark_failed(event.id, &error).await?;
                tracing::warn!(
                    event_id = %event.id,
                    subject = %subject,
                    retry_count = event.retry_count + 1,
                    error = %error,
                    "Failed to publish outbox event"
                );
                Ok(false)
            }
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped)
    ///
    /// Sweeps once on startup to catch up on rows committed while the publisher
    /// was down, then reacts to change notifications, the sweep interval, and the
    /// retry interval. If the notification stream ends it is re-opened on the
    /// next sweep tick.
    pub async fn run(self: Arc<Self>, channel: Arc<dyn ChangeChannel>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            subject_prefix = %self.config.subject_prefix,
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            retry_interval_ms = self.config.retry_interval.as_millis() as u64,
            "Starting outbox publisher"
        );

        let mut notifications = open_listener(channel.as_ref()).await;
        self.sweep().await;

        let mut sweep_ticker = interval(self.config.sweep_interval);
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep_ticker.tick().await;

        let mut retry_ticker = interval(self.config.retry_interval);
        retry_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry_ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                signalled = next_signal(&mut notifications) => match signalled {
                    Some(event_id) => {
                        if let Err(e) = self.publish_event_id(event_id).await {
                            tracing::error!(event_id = %event_id, error = %e, "Notification publish failed");
                        }
                    }
                    None => {
                        tracing::warn!("Outbox notification stream ended; falling back to sweeps");
                        notifications = None;
                    }
                },
                _ = sweep_ticker.tick() => {
                    if notifications.is_none() {
                        notifications = open_listener(channel.as_ref()).await;
                    }
                    self.sweep().await;
                }
                _ = retry_ticker.tick() => {
                    if let Err(e) = self.retry_failed_events().await {
                        tracing::error!(error = %e, "Outbox retry sweep failed");
                    }
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }

    async fn sweep(&self) {
        if let Err(e) = self.publish_pending(self.config.batch_size).await {
            tracing::error!(error = %e, "Outbox sweep failed");
        }
    }
}

fn aggregate_key(event: &OutboxEvent) -> (String, String) {
    (event.aggregate_type.clone(), event.aggregate_id.clone())
}

async fn open_listener(channel: &dyn ChangeChannel) -> Option<BoxStream<'static, Uuid>> {
    match channel.listen().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(error = %e, "Could not listen for outbox notifications; relying on sweeps");
            None
        }
    }
}

async fn next_signal(notifications: &mut Option<BoxStream<'static, Uuid>>) -> Option<Uuid> {
    match notifications {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}
