//! Publisher behavior against the in-memory ledger and bus

use async_trait::async_trait;
use event_bus::{BusMessage, BusResult, EventBus, EventEnvelope, InMemoryBus};
use futures::stream::BoxStream;
use outbox::{
    notify_committed, record_event, InMemoryChangeChannel, InMemoryOutbox,
    OutboxPublisher, OutboxStatus, OutboxStore, PublishReport, PublisherConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

fn config() -> PublisherConfig {
    PublisherConfig {
        subject_prefix: "fleet.events".to_string(),
        source_module: "vehicle-types".to_string(),
        source_version: "0.1.0".to_string(),
        ..PublisherConfig::default()
    }
}

fn publisher(ledger: &InMemoryOutbox, bus: &InMemoryBus) -> OutboxPublisher {
    OutboxPublisher::new(Arc::new(ledger.clone()), Arc::new(bus.clone()), config())
}

async fn commit_events(ledger: &InMemoryOutbox, aggregate_id: &str, count: usize) -> Vec<Uuid> {
    let mut tx = ledger.begin();
    let mut ids = Vec::new();
    for n in 0..count {
        let id = record_event(
            &mut tx,
            "VehicleType",
            aggregate_id,
            "vehicle_type.updated",
            json!({"name": format!("name-{n}")}),
        )
        .await
        .expect("record event");
        ids.push(id);
    }
    tx.commit().await;
    ids
}

fn published_ids(bus: &InMemoryBus) -> Vec<Uuid> {
    bus.published()
        .iter()
        .map(|msg| {
            serde_json::from_slice::<EventEnvelope<Value>>(&msg.payload)
                .expect("envelope")
                .event_id
        })
        .collect()
}

#[tokio::test]
async fn test_rolled_back_business_write_is_never_published() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();

    let mut tx = ledger.begin();
    record_event(&mut tx, "VehicleType", "vt-1", "vehicle_type.created", json!({"name": "Bus"}))
        .await
        .unwrap();
    tx.rollback();

    let report = publisher(&ledger, &bus).publish_pending(100).await.unwrap();

    assert_eq!(report, PublishReport::default());
    assert!(ledger.rows().await.is_empty());
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_pending_rows_published_oldest_first_in_envelopes() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let ids = commit_events(&ledger, "vt-1", 3).await;

    let report = publisher(&ledger, &bus).publish_pending(100).await.unwrap();

    assert_eq!(report, PublishReport { published: 3, failed: 0, held: 0 });
    assert_eq!(published_ids(&bus), ids);

    let first = &bus.published()[0];
    assert_eq!(first.subject, "fleet.events.vehicle_type.updated");
    let envelope: EventEnvelope<Value> = serde_json::from_slice(&first.payload).unwrap();
    assert_eq!(envelope.aggregate_type, "VehicleType");
    assert_eq!(envelope.aggregate_id, "vt-1");
    assert_eq!(envelope.source_module, "vehicle-types");
    assert_eq!(envelope.payload, json!({"name": "name-0"}));

    for id in ids {
        let row = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.published_at.is_some());
    }
}

#[tokio::test]
async fn test_batch_size_limits_a_sweep() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let ids = commit_events(&ledger, "vt-1", 5).await;

    let report = publisher(&ledger, &bus).publish_pending(2).await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(published_ids(&bus), ids[..2].to_vec());
    assert_eq!(ledger.count_by_status().await.unwrap().pending, 3);
}

#[tokio::test]
async fn test_broker_failure_marks_only_that_row_failed() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let first = commit_events(&ledger, "vt-1", 1).await;
    let others = [
        commit_events(&ledger, "vt-2", 1).await[0],
        commit_events(&ledger, "vt-3", 1).await[0],
    ];
    bus.fail_next(1);

    let report = publisher(&ledger, &bus).publish_pending(100).await.unwrap();

    assert_eq!(report, PublishReport { published: 2, failed: 1, held: 0 });
    let failed = ledger.get(first[0]).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.error_message.unwrap().contains("rejected"));
    assert_eq!(published_ids(&bus), others.to_vec());
}

#[tokio::test]
async fn test_broker_failure_holds_later_rows_of_that_aggregate() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let vt1 = commit_events(&ledger, "vt-1", 2).await;
    let vt2 = commit_events(&ledger, "vt-2", 1).await;
    bus.fail_next(1);
    let publisher = publisher(&ledger, &bus);

    let first_sweep = publisher.publish_pending(100).await.unwrap();
    assert_eq!(first_sweep, PublishReport { published: 1, failed: 1, held: 1 });
    assert_eq!(published_ids(&bus), vt2);

    // The failed row is still retryable, so the next sweep keeps holding vt-1.
    let second_sweep = publisher.publish_pending(100).await.unwrap();
    assert_eq!(second_sweep, PublishReport { published: 0, failed: 0, held: 1 });

    let retry = publisher.retry_failed_events().await.unwrap();
    assert_eq!((retry.requeued, retry.published), (1, 1));
    publisher.publish_pending(100).await.unwrap();

    assert_eq!(published_ids(&bus), vec![vt2[0], vt1[0], vt1[1]]);
    assert_eq!(ledger.count_by_status().await.unwrap().published, 3);
}

#[tokio::test]
async fn test_notification_waits_for_failed_row_of_its_aggregate() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let first = commit_events(&ledger, "vt-1", 1).await;
    bus.fail_next(1);
    let publisher = publisher(&ledger, &bus);
    publisher.publish_pending(100).await.unwrap();

    let second = commit_events(&ledger, "vt-1", 1).await;
    let report = publisher.publish_event_id(second[0]).await.unwrap();

    assert_eq!(report, PublishReport { published: 0, failed: 0, held: 1 });
    assert!(bus.published().is_empty());

    publisher.retry_failed_events().await.unwrap();
    publisher.publish_event_id(second[0]).await.unwrap();
    assert_eq!(published_ids(&bus), vec![first[0], second[0]]);
}

#[tokio::test]
async fn test_retry_keeps_aggregate_order_when_it_fails_again() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let first = commit_events(&ledger, "vt-1", 1).await;
    let publisher = publisher(&ledger, &bus);
    bus.fail_next(1);
    publisher.publish_pending(100).await.unwrap();

    // A second FAILED row of the same aggregate, e.g. from a fast-path publish
    // that raced the sweep.
    let second = commit_events(&ledger, "vt-1", 1).await;
    ledger.mark_failed(second[0], "broker down").await.unwrap();

    bus.fail_next(1);
    let retry = publisher.retry_failed_events().await.unwrap();

    assert_eq!((retry.requeued, retry.published, retry.failed), (1, 0, 1));
    let younger = ledger.get(second[0]).await.unwrap().unwrap();
    assert_eq!(younger.status, OutboxStatus::Failed);
    assert_eq!(younger.retry_count, 1);

    publisher.retry_failed_events().await.unwrap();
    assert_eq!(published_ids(&bus), vec![first[0], second[0]]);
}

#[tokio::test]
async fn test_exhausted_row_stops_holding_its_aggregate() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let first = commit_events(&ledger, "vt-1", 1).await;
    bus.fail_subject("fleet.events.>");
    let publisher = publisher(&ledger, &bus);
    publisher.publish_pending(100).await.unwrap();
    publisher.retry_failed_events().await.unwrap();
    publisher.retry_failed_events().await.unwrap();
    bus.clear_failures();

    let later = commit_events(&ledger, "vt-1", 1).await;
    let report = publisher.publish_pending(100).await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(published_ids(&bus), later);
    assert_eq!(ledger.get(first[0]).await.unwrap().unwrap().retry_count, 3);
}

#[tokio::test]
async fn test_restart_after_crash_mid_publish_keeps_aggregate_order() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let ids = commit_events(&ledger, "vt-1", 3).await;

    // First row reaches the broker, then the ledger write fails: the sweep stops there.
    ledger.fail_status_updates(1).await;
    let first_run = publisher(&ledger, &bus).publish_pending(100).await;
    assert!(first_run.is_err());
    assert_eq!(published_ids(&bus), vec![ids[0]]);

    let report = publisher(&ledger, &bus).publish_pending(100).await.unwrap();
    assert_eq!(report.published, 3);

    // At-least-once: ids[0] is duplicated, but never out of order.
    assert_eq!(published_ids(&bus), vec![ids[0], ids[0], ids[1], ids[2]]);
    assert_eq!(ledger.count_by_status().await.unwrap().published, 3);
}

#[tokio::test]
async fn test_retry_ceiling_stops_after_three_attempts() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let ids = commit_events(&ledger, "vt-1", 1).await;
    bus.fail_subject("fleet.events.>");
    let publisher = publisher(&ledger, &bus);

    publisher.publish_pending(100).await.unwrap();
    let second = publisher.retry_failed_events().await.unwrap();
    let third = publisher.retry_failed_events().await.unwrap();
    let fourth = publisher.retry_failed_events().await.unwrap();

    assert_eq!((second.requeued, second.failed), (1, 1));
    assert_eq!((third.requeued, third.failed), (1, 1));
    assert_eq!(fourth.requeued, 0);
    assert_eq!(fourth.exhausted, vec![ids[0]]);

    let row = ledger.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_retry_publishes_once_broker_recovers() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let ids = commit_events(&ledger, "vt-1", 1).await;
    bus.fail_next(1);
    let publisher = publisher(&ledger, &bus);

    publisher.publish_pending(100).await.unwrap();
    let report = publisher.retry_failed_events().await.unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(report.published, 1);
    let row = ledger.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
    assert_eq!(row.retry_count, 1);
    assert!(row.error_message.is_none());
}

#[tokio::test]
async fn test_notification_publishes_older_rows_of_same_aggregate_first() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let older = commit_events(&ledger, "vt-1", 2).await;
    let unrelated = commit_events(&ledger, "vt-2", 1).await;
    let newest = commit_events(&ledger, "vt-1", 1).await;

    let report = publisher(&ledger, &bus).publish_event_id(newest[0]).await.unwrap();

    assert_eq!(report.published, 3);
    assert_eq!(published_ids(&bus), vec![older[0], older[1], newest[0]]);
    let untouched = ledger.get(unrelated[0]).await.unwrap().unwrap();
    assert_eq!(untouched.status, OutboxStatus::Pending);
}

#[tokio::test]
async fn test_duplicate_notification_is_a_no_op() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let ids = commit_events(&ledger, "vt-1", 1).await;
    let publisher = publisher(&ledger, &bus);

    publisher.publish_event_id(ids[0]).await.unwrap();
    let second = publisher.publish_event_id(ids[0]).await.unwrap();
    let unknown = publisher.publish_event_id(Uuid::new_v4()).await.unwrap();

    assert_eq!(second, PublishReport::default());
    assert_eq!(unknown, PublishReport::default());
    assert_eq!(bus.published().len(), 1);
}

/// A broker that accepts the connection but never acknowledges
struct StalledBus;

#[async_trait]
impl EventBus for StalledBus {
    async fn publish(&self, _subject: &str, _payload: Vec<u8>) -> BusResult<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn subscribe(&self, _subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_publish_times_out_and_marks_failed() {
    let ledger = InMemoryOutbox::new();
    let ids = commit_events(&ledger, "vt-1", 1).await;
    let publisher = OutboxPublisher::new(
        Arc::new(ledger.clone()),
        Arc::new(StalledBus),
        PublisherConfig {
            publish_timeout: Duration::from_secs(2),
            ..config()
        },
    );

    let report = publisher.publish_pending(100).await.unwrap();

    assert_eq!(report.failed, 1);
    let row = ledger.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert!(row.error_message.unwrap().contains("timed out"));
}

async fn wait_for_published(bus: &InMemoryBus, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while bus.published().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events were not published in time");
}

#[tokio::test]
async fn test_run_loop_publishes_on_notification_and_stops_on_shutdown() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let channel = InMemoryChangeChannel::new();
    let publisher = Arc::new(OutboxPublisher::new(
        Arc::new(ledger.clone()),
        Arc::new(bus.clone()),
        PublisherConfig {
            sweep_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(3600),
            ..config()
        },
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(publisher.run(Arc::new(channel.clone()), shutdown_rx));

    // Let the loop subscribe before signalling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ids = commit_events(&ledger, "vt-1", 1).await;
    notify_committed(&channel, &ids).await;

    wait_for_published(&bus, 1).await;
    assert_eq!(published_ids(&bus), ids);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("publisher did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_lost_signals_are_covered_by_sweeps() {
    let ledger = InMemoryOutbox::new();
    let bus = InMemoryBus::new();
    let channel = InMemoryChangeChannel::new();
    channel.set_dropping(true);

    // Committed while the publisher was down: picked up by the startup sweep.
    let before = commit_events(&ledger, "vt-1", 1).await;

    let publisher = Arc::new(OutboxPublisher::new(
        Arc::new(ledger.clone()),
        Arc::new(bus.clone()),
        PublisherConfig {
            sweep_interval: Duration::from_millis(20),
            ..config()
        },
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(publisher.run(Arc::new(channel.clone()), shutdown_rx));

    wait_for_published(&bus, 1).await;

    // Committed while running, signal dropped: picked up by the interval sweep.
    let after = commit_events(&ledger, "vt-1", 1).await;
    notify_committed(&channel, &after).await;
    wait_for_published(&bus, 2).await;

    assert_eq!(published_ids(&bus), vec![before[0], after[0]]);

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("publisher did not stop")
        .unwrap();
}
