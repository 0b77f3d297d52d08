//! Change notification: a wake-up hint from the writer to the publisher
//!
//! Signals are best-effort. Lost or duplicated signals never cause a lost or
//! duplicated publish, because the publisher re-reads status from the ledger
//! and sweeps on a fixed interval anyway.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ChannelResult;

/// Postgres channel name used when none is configured
pub const DEFAULT_CHANNEL: &str = "outbox_events";

#[async_trait]
pub trait ChangeChannel: Send + Sync {
    /// Signal that `event_id` was committed to the outbox
    async fn notify(&self, event_id: Uuid) -> ChannelResult<()>;

    /// Stream of signalled event ids, starting from now
    async fn listen(&self) -> ChannelResult<BoxStream<'static, Uuid>>;
}

/// Signal every committed id, logging (not returning) failures
///
/// The business operation has already committed when this runs; a failed
/// signal only delays publication until the next sweep.
pub async fn notify_committed(channel: &dyn ChangeChannel, event_ids: &[Uuid]) {
    for event_id in event_ids {
        if let Err(e) = channel.notify(*event_id).await {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "Failed to signal committed outbox event; sweep will pick it up"
            );
        }
    }
}

/// `LISTEN/NOTIFY` over the outbox database
#[derive(Clone)]
pub struct PgChangeChannel {
    pool: PgPool,
    channel: String,
}

impl PgChangeChannel {
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, DEFAULT_CHANNEL)
    }

    pub fn with_channel(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ChangeChannel for PgChangeChannel {
    async fn notify(&self, event_id: Uuid) -> ChannelResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn listen(&self) -> ChannelResult<BoxStream<'static, Uuid>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        tracing::info!(channel = %self.channel, "Listening for outbox notifications");

        let channel = self.channel.clone();
        let stream = listener.into_stream().filter_map(move |notification| {
            let channel = channel.clone();
            async move {
                match notification {
                    Ok(notification) => match Uuid::parse_str(notification.payload()) {
                        Ok(event_id) => Some(event_id),
                        Err(e) => {
                            tracing::warn!(
                                channel = %channel,
                                payload = %notification.payload(),
                                error = %e,
                                "Ignoring outbox notification with non-UUID payload"
                            );
                            None
                        }
                    },
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Outbox listener error");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Broadcast-backed channel for tests and single-process setups
#[derive(Clone)]
pub struct InMemoryChangeChannel {
    sender: Arc<broadcast::Sender<Uuid>>,
    dropping: Arc<AtomicBool>,
}

impl InMemoryChangeChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self {
            sender: Arc::new(sender),
            dropping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Silently discard signals while `true`
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }
}

impl Default for InMemoryChangeChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeChannel for InMemoryChangeChannel {
    async fn notify(&self, event_id: Uuid) -> ChannelResult<()> {
        if self.dropping.load(Ordering::SeqCst) {
            return Ok(());
        }
        // No listeners is not an error
        let _ = self.sender.send(event_id);
        Ok(())
    }

    async fn listen(&self) -> ChannelResult<BoxStream<'static, Uuid>> {
        let mut receiver = self.sender.subscribe();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event_id) => yield event_id,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Change listener lagged; sweep will cover skipped ids");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
