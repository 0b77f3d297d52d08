//! IdempotentConsumer behavior with in-memory seams

use async_trait::async_trait;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{BusMessage, EventBus, EventEnvelope, InMemoryBus};
use event_consumer::{
    ConsumerError, EventHandler, GuardStrategy, HandlerError, IdempotencyStore, IdempotentConsumer,
    InMemoryDeadLetterSink, InMemoryIdempotencyStore, ProcessOutcome,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Counts applications; fails transiently for the first `fail_first` calls
#[derive(Default)]
struct CountingHandler {
    applied: AtomicU32,
    calls: AtomicU32,
    fail_first: u32,
    permanent: bool,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &EventEnvelope<Value>) -> Result<ProcessOutcome, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.permanent {
            return Err(HandlerError::Permanent("unknown vehicle type".to_string()));
        }
        if call <= self.fail_first {
            return Err(HandlerError::Transient(format!("database busy ({call})")));
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessOutcome::Applied)
    }
}

fn message(event_type: &str) -> BusMessage {
    let envelope = EventEnvelope::new(event_type, "VehicleType", "vt-1", json!({"name": "Minibus"}))
        .with_source("vehicle-types", "0.1.0");
    BusMessage::new(
        format!("fleet.events.{event_type}"),
        serde_json::to_vec(&envelope).unwrap(),
    )
}

fn fast_retry() -> RetryConfig {
    RetryConfig::new(3, Duration::from_millis(10), Duration::from_millis(100))
}

fn consumer(
    handler: Arc<CountingHandler>,
    store: &InMemoryIdempotencyStore,
    dlq: &InMemoryDeadLetterSink,
) -> IdempotentConsumer {
    IdempotentConsumer::new(
        "test-consumer",
        handler,
        GuardStrategy::MarkFirst(Arc::new(store.clone())),
        Arc::new(dlq.clone()),
    )
    .with_retry(fast_retry())
}

#[tokio::test]
async fn test_redelivered_event_applies_effect_once() {
    let handler = Arc::new(CountingHandler::default());
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let consumer = consumer(handler.clone(), &store, &dlq);
    let msg = message("vehicle_type.updated");

    let first = consumer.process_message(&msg).await.unwrap();
    let second = consumer.process_message(&msg).await.unwrap();

    assert_eq!(first, ProcessOutcome::Applied);
    assert_eq!(second, ProcessOutcome::Duplicate);
    assert_eq!(handler.applied.load(Ordering::SeqCst), 1);
    assert_eq!(store.len().await, 1);
    assert!(dlq.letters().await.is_empty());
}

#[tokio::test]
async fn test_marker_records_event_identity() {
    let handler = Arc::new(CountingHandler::default());
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let msg = message("vehicle_type.updated");
    let envelope: EventEnvelope<Value> = serde_json::from_slice(&msg.payload).unwrap();

    consumer(handler, &store, &dlq).process_message(&msg).await.unwrap();

    let record = store.get(&envelope.event_id.to_string()).await.unwrap().unwrap();
    assert_eq!(record.event_type, "vehicle_type.updated");
    assert_eq!(record.payload, json!({"name": "Minibus"}));
}

#[tokio::test]
async fn test_malformed_envelope_goes_to_dlq_without_retry() {
    let handler = Arc::new(CountingHandler::default());
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let msg = BusMessage::new("fleet.events.vehicle_type.updated", b"{not json".to_vec());

    let result = consumer(handler.clone(), &store, &dlq).process_message(&msg).await;

    assert!(matches!(result, Err(ConsumerError::MalformedEnvelope { .. })));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert!(store.is_empty().await);

    let letters = dlq.letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event_id, None);
    assert_eq!(letters[0].retry_count, 0);
    assert_eq!(letters[0].payload, "{not json");
}

#[tokio::test]
async fn test_envelope_missing_event_id_is_malformed() {
    let handler = Arc::new(CountingHandler::default());
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let body = json!({"event_type": "vehicle_type.updated", "payload": {}});
    let msg = BusMessage::new("fleet.events.vehicle_type.updated", serde_json::to_vec(&body).unwrap());

    let result = consumer(handler, &store, &dlq).process_message(&msg).await;

    assert!(matches!(result, Err(ConsumerError::MalformedEnvelope { .. })));
    assert_eq!(dlq.letters().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_with_backoff() {
    let handler = Arc::new(CountingHandler {
        fail_first: 2,
        ..CountingHandler::default()
    });
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let start = tokio::time::Instant::now();

    let outcome = consumer(handler.clone(), &store, &dlq)
        .process_message(&message("vehicle_type.deleted"))
        .await
        .unwrap();

    assert_eq!(outcome, ProcessOutcome::Applied);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    // 10ms + 20ms of backoff
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(dlq.letters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_handler_is_dead_lettered_and_stays_marked() {
    let handler = Arc::new(CountingHandler {
        fail_first: u32::MAX,
        ..CountingHandler::default()
    });
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let consumer = consumer(handler.clone(), &store, &dlq);
    let msg = message("vehicle_type.updated");

    let result = consumer.process_message(&msg).await;

    assert!(matches!(result, Err(ConsumerError::HandlerFailed { attempts: 3, .. })));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let letters = dlq.letters().await;
    assert_eq!(letters.len(), 1);
    assert!(letters[0].event_id.is_some());
    assert_eq!(letters[0].retry_count, 3);

    // Mark-first: the broker redelivering does not re-run the handler; replay goes through the DLQ.
    let redelivered = consumer.process_message(&msg).await.unwrap();
    assert_eq!(redelivered, ProcessOutcome::Duplicate);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permanent_handler_error_is_not_retried() {
    let handler = Arc::new(CountingHandler {
        permanent: true,
        ..CountingHandler::default()
    });
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();

    let result = consumer(handler.clone(), &store, &dlq)
        .process_message(&message("vehicle_type.updated"))
        .await;

    assert!(matches!(result, Err(ConsumerError::HandlerFailed { attempts: 1, .. })));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(dlq.letters().await[0].retry_count, 1);
}

/// Marks and applies under one lock, the way a transactional handler does with a database
#[derive(Default)]
struct TransactionalHandler {
    state: Mutex<(HashSet<String>, u32)>,
}

#[async_trait]
impl EventHandler for TransactionalHandler {
    async fn handle(&self, event: &EventEnvelope<Value>) -> Result<ProcessOutcome, HandlerError> {
        let mut state = self.state.lock().await;
        if !state.0.insert(event.event_id.to_string()) {
            return Ok(ProcessOutcome::Duplicate);
        }
        state.1 += 1;
        Ok(ProcessOutcome::Applied)
    }
}

#[tokio::test]
async fn test_transactional_guard_defers_to_handler() {
    let handler = Arc::new(TransactionalHandler::default());
    let dlq = InMemoryDeadLetterSink::new();
    let consumer = IdempotentConsumer::new(
        "transactional",
        handler.clone(),
        GuardStrategy::Transactional,
        Arc::new(dlq.clone()),
    );
    let msg = message("vehicle_type.updated");

    assert_eq!(consumer.process_message(&msg).await.unwrap(), ProcessOutcome::Applied);
    assert_eq!(consumer.process_message(&msg).await.unwrap(), ProcessOutcome::Duplicate);
    assert_eq!(handler.state.lock().await.1, 1);
}

#[tokio::test]
async fn test_run_loop_survives_broker_redelivery() {
    let bus = InMemoryBus::new();
    let handler = Arc::new(CountingHandler::default());
    let store = InMemoryIdempotencyStore::new();
    let dlq = InMemoryDeadLetterSink::new();
    let consumer = Arc::new(consumer(handler.clone(), &store, &dlq));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn({
        let bus: Arc<dyn EventBus> = Arc::new(bus.clone());
        async move { consumer.run(bus, "fleet.events.>", shutdown_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let msg = message("vehicle_type.updated");
    bus.publish(&msg.subject, msg.payload.clone()).await.unwrap();
    bus.redeliver(msg.clone());

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.len().await < 1 || handler.calls.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message was not consumed");
    // Give the redelivered copy time to be processed too.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.applied.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("consumer did not stop")
        .unwrap()
        .unwrap();
}
