//! Outbox rows handed to the Postgres webhook job queue
//!
//! Requires DATABASE_URL; run with `--ignored`.

mod common;

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use common::{get_test_pool, reset_outbox, reset_webhook_jobs, unique_name};
use outbox::{record_event, OutboxStore, PgOutboxStore};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;
use webhooks::{
    DeliveryQueue, ForwarderConfig, JobStatus, NotifierConfig, PgDeliveryLog, PgDeliveryQueue,
    PgSubscriptionStore, TransportError, WebhookForwarder, WebhookMetadata, WebhookNotifier, WebhookRequest,
    WebhookResponse, WebhookTransport,
};

struct AcceptingTransport;

#[async_trait]
impl WebhookTransport for AcceptingTransport {
    async fn send(&self, _request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        Ok(WebhookResponse {
            status: 200,
            body: "ok".to_string(),
        })
    }
}

async fn subscribe(pool: &PgPool, event_type: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO webhook_subscriptions (id, event_type, url, secret) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(event_type)
        .bind("https://hooks.example.com/fleet")
        .bind("test-secret")
        .execute(pool)
        .await
        .expect("Failed to insert subscription");
    id
}

async fn record(pool: &PgPool, event_type: &str) -> Uuid {
    let mut tx = pool.begin().await.unwrap();
    let id = record_event(
        &mut tx,
        "vehicle_type",
        &Uuid::new_v4().to_string(),
        event_type,
        json!({ "name": "Tram" }),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    id
}

fn forwarder(pool: &PgPool) -> WebhookForwarder {
    let notifier = WebhookNotifier::new(
        Arc::new(PgSubscriptionStore::new(pool.clone())),
        Arc::new(AcceptingTransport),
        Arc::new(PgDeliveryLog::new(pool.clone())),
        NotifierConfig::default(),
    );
    WebhookForwarder::new(
        Arc::new(PgOutboxStore::new(pool.clone())),
        Arc::new(PgDeliveryQueue::new(pool.clone())),
        Arc::new(notifier),
        "1.0",
        WebhookMetadata {
            source: "vehicle-types".to_string(),
            environment: "test".to_string(),
        },
        ForwarderConfig::default(),
    )
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_handoff_queues_one_job_per_subscription_once() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    reset_webhook_jobs(&pool).await;
    let event_type = unique_name("vehicle_type.retired");
    let first = subscribe(&pool, &event_type).await;
    let second = subscribe(&pool, &event_type).await;
    let event_id = record(&pool, &event_type).await;
    let forwarder = forwarder(&pool);

    assert_eq!(forwarder.forward_pending().await.unwrap(), 1);
    assert_eq!(forwarder.forward_pending().await.unwrap(), 0);

    let queue = PgDeliveryQueue::new(pool.clone());
    let jobs = queue.jobs_for_event(event_id).await.unwrap();
    let mut subscribers: Vec<Uuid> = jobs.iter().map(|job| job.subscription_id).collect();
    subscribers.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(subscribers, expected);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Pending && job.attempts == 0));

    let store = PgOutboxStore::new(pool.clone());
    assert!(store.fetch_unforwarded(10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_claimed_job_is_leased_away_from_other_sweeps() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    reset_webhook_jobs(&pool).await;
    let event_type = unique_name("vehicle_type.retired");
    subscribe(&pool, &event_type).await;
    record(&pool, &event_type).await;
    forwarder(&pool).forward_pending().await.unwrap();

    let queue = PgDeliveryQueue::new(pool.clone());
    let now = Utc::now();
    let lease_until = now + TimeDelta::seconds(60);

    assert_eq!(queue.claim_due(now, lease_until, 10).await.unwrap().len(), 1);
    assert!(queue.claim_due(now, lease_until, 10).await.unwrap().is_empty());

    let after_lease = lease_until + TimeDelta::seconds(1);
    let reclaimed = queue
        .claim_due(after_lease, after_lease + TimeDelta::seconds(60), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_delivered_job_is_finished_and_audited() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    reset_webhook_jobs(&pool).await;
    let event_type = unique_name("vehicle_type.retired");
    let subscription_id = subscribe(&pool, &event_type).await;
    let event_id = record(&pool, &event_type).await;
    let forwarder = forwarder(&pool);
    forwarder.forward_pending().await.unwrap();

    let report = forwarder.deliver_due(Utc::now()).await.unwrap();
    assert_eq!(report.delivered, 1);

    let jobs = PgDeliveryQueue::new(pool.clone()).jobs_for_event(event_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Delivered);
    assert_eq!(jobs[0].attempts, 1);

    let attempts: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM webhook_deliveries WHERE event_id = $1 AND subscription_id = $2 AND status = 'success'",
    )
    .bind(event_id)
    .bind(subscription_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(attempts, 1);

    // Nothing left to claim.
    assert_eq!(forwarder.deliver_due(Utc::now()).await.unwrap().delivered, 0);
}
