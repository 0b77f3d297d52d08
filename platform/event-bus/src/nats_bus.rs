//! NATS-based implementation of the EventBus trait

use crate::{validate_publish_subject, BusError, BusMessage, BusResult, EventBus};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;

/// EventBus implementation over a NATS connection
///
/// `publish` flushes the client after enqueueing so that `Ok(())` means the
/// message reached the server, which is what the outbox publisher needs before
/// marking a row PUBLISHED.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::connect("nats://localhost:4222").await?;
/// bus.publish("fleet.events.vehicle_type.created", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Open a connection to `url` and wrap it
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(format!("{url}: {e}")))?;

        tracing::info!(url = %url, "Connected to NATS");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        validate_publish_subject(subject)?;

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        self.client
            .flush()
            .await
            .map_err(|e| BusError::PublishError(format!("flush failed: {e}")))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            let headers: HashMap<String, String> = nats_msg
                .headers
                .iter()
                .flat_map(|headers| headers.iter())
                .filter_map(|(key, values)| {
                    values
                        .first()
                        .map(|value| (key.to_string(), value.to_string()))
                })
                .collect();

            if headers.is_empty() {
                msg
            } else {
                msg.with_headers(headers)
            }
        });

        Ok(stream.boxed())
    }
}
