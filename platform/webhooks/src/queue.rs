//! Durable per-subscriber delivery jobs (`webhook_jobs`)
//!
//! One job exists per (event, subscription). A failed attempt moves the job's
//! `next_attempt_at` forward instead of sleeping, so retries survive restarts
//! and a slow subscriber never holds up anyone else's deliveries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{WebhookError, WebhookResult};
use crate::payload::WebhookPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Delivered,
    /// Ran out of attempts
    Exhausted,
    /// Permanent failure such as an invalid URL
    Rejected,
    /// Subscription removed or deactivated before delivery
    Abandoned,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Delivered => "delivered",
            JobStatus::Exhausted => "exhausted",
            JobStatus::Rejected => "rejected",
            JobStatus::Abandoned => "abandoned",
        }
    }
}

impl FromStr for JobStatus {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "delivered" => Ok(JobStatus::Delivered),
            "exhausted" => Ok(JobStatus::Exhausted),
            "rejected" => Ok(JobStatus::Rejected),
            "abandoned" => Ok(JobStatus::Abandoned),
            other => Err(WebhookError::UnknownJobStatus(other.to_string())),
        }
    }
}

/// Delivery of one event to one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub payload: WebhookPayload,
    pub status: JobStatus,
    /// Attempts made so far
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// A job due immediately
    pub fn new(payload: &WebhookPayload, subscription_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: payload.id,
            subscription_id,
            payload: payload.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Add `job` unless its (event, subscription) pair is already queued.
    /// Returns whether it was added.
    async fn enqueue(&self, job: &DeliveryJob) -> WebhookResult<bool>;

    /// Claim up to `limit` pending jobs due at `now`, oldest first
    ///
    /// Claimed jobs are pushed to `lease_until`: other dispatchers skip them,
    /// and they come due again if the claiming dispatcher dies mid-attempt.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> WebhookResult<Vec<DeliveryJob>>;

    /// Record a failed attempt and schedule the next one
    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> WebhookResult<()>;

    /// Move a pending job to a final status
    async fn finish(&self, id: Uuid, status: JobStatus, attempts: i32, error: Option<&str>) -> WebhookResult<()>;

    async fn jobs_for_event(&self, event_id: Uuid) -> WebhookResult<Vec<DeliveryJob>>;
}

const JOB_COLUMNS: &str =
    "id, event_id, subscription_id, payload, status, attempts, next_attempt_at, last_error, created_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    event_id: Uuid,
    subscription_id: Uuid,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for DeliveryJob {
    type Error = WebhookError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(DeliveryJob {
            id: row.id,
            event_id: row.event_id,
            subscription_id: row.subscription_id,
            payload: serde_json::from_value(row.payload)?,
            status: row.status.parse()?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> WebhookResult<Vec<DeliveryJob>> {
    rows.into_iter().map(DeliveryJob::try_from).collect()
}

/// `webhook_jobs`; claims use `FOR UPDATE SKIP LOCKED` so several service
/// instances can sweep the same table
#[derive(Clone)]
pub struct PgDeliveryQueue {
    pool: PgPool,
}

impl PgDeliveryQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryQueue for PgDeliveryQueue {
    async fn enqueue(&self, job: &DeliveryJob) -> WebhookResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_jobs
                (id, event_id, subscription_id, payload, status, attempts, next_attempt_at, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id, subscription_id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.event_id)
        .bind(job.subscription_id)
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.next_attempt_at)
        .bind(&job.last_error)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> WebhookResult<Vec<DeliveryJob>> {
        let sql = format!(
            r#"
            UPDATE webhook_jobs
            SET next_attempt_at = $3, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM webhook_jobs
                WHERE status = $1 AND next_attempt_at <= $2
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(JobStatus::Pending.as_str())
            .bind(now)
            .bind(lease_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING carries no order.
        let mut jobs = into_jobs(rows)?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> WebhookResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET attempts = $2, next_attempt_at = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish(&self, id: Uuid, status: JobStatus, attempts: i32, error: Option<&str>) -> WebhookResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET status = $2, attempts = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(attempts)
        .bind(error)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn jobs_for_event(&self, event_id: Uuid) -> WebhookResult<Vec<DeliveryJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM webhook_jobs WHERE event_id = $1 ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeliveryQueue {
    jobs: Arc<Mutex<Vec<DeliveryJob>>>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<DeliveryJob> {
        self.jobs.lock().await.clone()
    }

    async fn update_pending(&self, id: Uuid, apply: impl FnOnce(&mut DeliveryJob) + Send) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs
            .iter_mut()
            .find(|job| job.id == id && job.status == JobStatus::Pending)
        {
            apply(job);
        }
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, job: &DeliveryJob) -> WebhookResult<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs
            .iter()
            .any(|j| j.event_id == job.event_id && j.subscription_id == job.subscription_id)
        {
            return Ok(false);
        }
        jobs.push(job.clone());
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> WebhookResult<Vec<DeliveryJob>> {
        let mut jobs = self.jobs.lock().await;
        let mut due: Vec<&mut DeliveryJob> = jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Pending && job.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|job| (job.next_attempt_at, job.created_at));
        due.truncate(usize::try_from(limit).unwrap_or(0));

        let mut claimed: Vec<DeliveryJob> = due
            .into_iter()
            .map(|job| {
                job.next_attempt_at = lease_until;
                job.clone()
            })
            .collect();
        claimed.sort_by_key(|job| job.created_at);
        Ok(claimed)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> WebhookResult<()> {
        let error = error.to_string();
        self.update_pending(id, move |job| {
            job.attempts = attempts;
            job.next_attempt_at = next_attempt_at;
            job.last_error = Some(error);
        })
        .await;
        Ok(())
    }

    async fn finish(&self, id: Uuid, status: JobStatus, attempts: i32, error: Option<&str>) -> WebhookResult<()> {
        let error = error.map(str::to_string);
        self.update_pending(id, move |job| {
            job.status = status;
            job.attempts = attempts;
            job.last_error = error;
        })
        .await;
        Ok(())
    }

    async fn jobs_for_event(&self, event_id: Uuid) -> WebhookResult<Vec<DeliveryJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|job| job.event_id == event_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::WebhookMetadata;
    use chrono::Duration;
    use serde_json::json;

    fn payload() -> WebhookPayload {
        let id = Uuid::new_v4();
        WebhookPayload {
            event: "vehicle_type.created".to_string(),
            version: "1.0".to_string(),
            id,
            idempotency_key: format!("vehicle_type.created-vt-1-{id}"),
            timestamp: 1_772_000_000_000,
            data: json!({"name": "Bus"}),
            metadata: WebhookMetadata {
                source: "vehicle-types".to_string(),
                environment: "test".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_one_job_per_event_and_subscription() {
        let queue = InMemoryDeliveryQueue::new();
        let event = payload();
        let subscription = Uuid::new_v4();
        let now = Utc::now();

        assert!(queue.enqueue(&DeliveryJob::new(&event, subscription, now)).await.unwrap());
        assert!(!queue.enqueue(&DeliveryJob::new(&event, subscription, now)).await.unwrap());
        assert!(queue.enqueue(&DeliveryJob::new(&event, Uuid::new_v4(), now)).await.unwrap());

        assert_eq!(queue.jobs_for_event(event.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claimed_job_is_leased_until_rescheduled() {
        let queue = InMemoryDeliveryQueue::new();
        let now = Utc::now();
        let job = DeliveryJob::new(&payload(), Uuid::new_v4(), now);
        queue.enqueue(&job).await.unwrap();
        let lease_until = now + Duration::seconds(60);

        let claimed = queue.claim_due(now, lease_until, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(queue.claim_due(now, lease_until, 10).await.unwrap().is_empty());
        assert_eq!(queue.claim_due(lease_until, lease_until, 10).await.unwrap().len(), 1);

        queue
            .reschedule(job.id, 1, now + Duration::seconds(2), "HTTP 500")
            .await
            .unwrap();
        let stored = &queue.jobs().await[0];
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 500"));
        assert_eq!(stored.next_attempt_at, now + Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_finished_jobs_are_never_claimed_again() {
        let queue = InMemoryDeliveryQueue::new();
        let now = Utc::now();
        let job = DeliveryJob::new(&payload(), Uuid::new_v4(), now);
        queue.enqueue(&job).await.unwrap();

        queue.finish(job.id, JobStatus::Delivered, 1, None).await.unwrap();
        queue
            .reschedule(job.id, 2, now, "late failure report")
            .await
            .unwrap();

        let stored = &queue.jobs().await[0];
        assert_eq!(stored.status, JobStatus::Delivered);
        assert_eq!(stored.attempts, 1);
        assert!(queue
            .claim_due(now + Duration::days(1), now + Duration::days(2), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Delivered,
            JobStatus::Exhausted,
            JobStatus::Rejected,
            JobStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("lost".parse::<JobStatus>().is_err());
    }
}
