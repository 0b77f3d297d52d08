//! In-memory implementation of the EventBus trait for testing and development

use crate::{subject_matches, validate_publish_subject, BusError, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// EventBus implementation using a tokio broadcast channel
///
/// Besides fan-out to subscribers, the bus keeps a journal of every accepted
/// message (in acceptance order) so tests can assert on what a publisher emitted,
/// and it can be told to reject publishes to exercise failure paths.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe("fleet.events.>").await?;
///
/// bus.publish("fleet.events.vehicle_type.created", b"hello".to_vec()).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "fleet.events.vehicle_type.created");
/// assert_eq!(bus.published().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    journal: Arc<Mutex<Vec<BusMessage>>>,
    faults: Arc<Mutex<FaultPlan>>,
}

#[derive(Default)]
struct FaultPlan {
    /// Reject this many upcoming publishes regardless of subject
    fail_next: usize,
    /// Reject every publish whose subject matches one of these patterns
    failing_patterns: Vec<String>,
}

impl FaultPlan {
    fn should_fail(&mut self, subject: &str) -> bool {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return true;
        }
        self.failing_patterns
            .iter()
            .any(|pattern| subject_matches(subject, pattern))
    }
}

impl InMemoryBus {
    /// Create a bus buffering up to 1000 undelivered messages per subscriber
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            journal: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(FaultPlan::default())),
        }
    }

    /// Every message accepted so far, oldest first
    pub fn published(&self) -> Vec<BusMessage> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Accepted messages whose subject matches `pattern`
    pub fn published_matching(&self, pattern: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|msg| subject_matches(&msg.subject, pattern))
            .collect()
    }

    /// Reject the next `count` publishes
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_next = count;
        }
    }

    /// Reject every publish to subjects matching `pattern` until cleared
    pub fn fail_subject(&self, pattern: impl Into<String>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_patterns.push(pattern.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = FaultPlan::default();
        }
    }

    /// Re-send an already accepted message, as a broker does on redelivery
    pub fn redeliver(&self, msg: BusMessage) {
        let _ = self.sender.send(msg);
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        validate_publish_subject(subject)?;

        let rejected = self
            .faults
            .lock()
            .map(|mut faults| faults.should_fail(subject))
            .unwrap_or(false);
        if rejected {
            return Err(BusError::PublishError(format!(
                "in-memory bus rejected publish to {subject}"
            )));
        }

        let msg = BusMessage::new(subject, payload);
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(msg.clone());
        }

        // No receivers is fine: nobody subscribed yet
        let _ = self.sender.send(msg);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if subject_matches(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            pattern = %pattern,
                            skipped = skipped,
                            "InMemoryBus subscriber lagged, messages skipped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
