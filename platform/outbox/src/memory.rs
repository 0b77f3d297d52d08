//! In-memory outbox with real commit/rollback semantics

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::ledger::{OutboxStore, OutboxTx};
use crate::models::{OutboxEvent, OutboxStatus, StatusCounts};

#[derive(Default)]
struct State {
    // Committed rows in insertion order; ordered reads rely on a stable sort.
    rows: Vec<OutboxEvent>,
    forwarded: HashSet<Uuid>,
    failing_updates: usize,
}

/// Outbox ledger held in process memory
///
/// Writes go through an [`InMemoryOutboxTx`] and only land in the ledger on
/// [`InMemoryOutboxTx::commit`]. Dropping the transaction discards its rows.
///
/// # Example
/// ```rust
/// use outbox::{record_event, InMemoryOutbox, OutboxStore};
///
/// # async fn example() -> Result<(), outbox::OutboxError> {
/// let ledger = InMemoryOutbox::new();
///
/// let mut tx = ledger.begin();
/// record_event(&mut tx, "VehicleType", "vt-1", "vehicle_type.created", serde_json::json!({})).await?;
/// tx.rollback();
///
/// assert!(ledger.fetch_pending(10).await?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> InMemoryOutboxTx {
        InMemoryOutboxTx {
            ledger: self.clone(),
            staged: Vec::new(),
        }
    }

    /// Every committed row, in insertion order
    pub async fn rows(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.rows.clone()
    }

    /// Make the next `count` status transitions fail as if the database were down
    pub async fn fail_status_updates(&self, count: usize) {
        self.state.lock().await.failing_updates = count;
    }

    async fn transition(
        &self,
        id: Uuid,
        from: OutboxStatus,
        apply: impl FnOnce(&mut OutboxEvent) + Send,
    ) -> OutboxResult<bool> {
        let mut state = self.state.lock().await;

        if state.failing_updates > 0 {
            state.failing_updates -= 1;
            return Err(OutboxError::Unavailable("injected status update failure".to_string()));
        }

        match state.rows.iter_mut().find(|row| row.id == id) {
            Some(row) if row.status == from => {
                apply(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn select(
        &self,
        limit: i64,
        filter: impl Fn(&OutboxEvent) -> bool + Send,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        let mut rows: Vec<OutboxEvent> = state.rows.iter().filter(|row| filter(row)).cloned().collect();
        rows.sort_by_key(|row| row.created_at);
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }
}

/// Open write transaction against an [`InMemoryOutbox`]
pub struct InMemoryOutboxTx {
    ledger: InMemoryOutbox,
    staged: Vec<OutboxEvent>,
}

impl InMemoryOutboxTx {
    pub async fn commit(self) {
        let mut state = self.ledger.state.lock().await;
        state.rows.extend(self.staged);
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxTx for InMemoryOutboxTx {
    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> OutboxResult<()> {
        self.staged.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn fetch_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        self.select(limit, |row| row.status == OutboxStatus::Pending).await
    }

    async fn fetch_pending_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        self.select(limit, |row| {
            row.status == OutboxStatus::Pending
                && row.aggregate_type == aggregate_type
                && row.aggregate_id == aggregate_id
        })
        .await
    }

    async fn fetch_failed(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        self.select(limit, |row| row.status == OutboxStatus::Failed).await
    }

    async fn fetch_retrying_aggregates(&self, max_retries: i32) -> OutboxResult<Vec<(String, String)>> {
        let state = self.state.lock().await;
        let mut aggregates: Vec<(String, String)> = Vec::new();
        for row in &state.rows {
            let key = (row.aggregate_type.clone(), row.aggregate_id.clone());
            if row.status == OutboxStatus::Failed && row.retry_count < max_retries && !aggregates.contains(&key) {
                aggregates.push(key);
            }
        }
        Ok(aggregates)
    }

    async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().find(|row| row.id == id).cloned())
    }

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> OutboxResult<bool> {
        self.transition(id, OutboxStatus::Pending, move |row| {
            row.status = OutboxStatus::Published;
            row.published_at = Some(published_at);
            row.error_message = None;
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<bool> {
        let error = error.to_string();
        self.transition(id, OutboxStatus::Pending, move |row| {
            row.status = OutboxStatus::Failed;
            row.retry_count += 1;
            row.error_message = Some(error);
        })
        .await
    }

    async fn reset_to_pending(&self, id: Uuid) -> OutboxResult<bool> {
        self.transition(id, OutboxStatus::Failed, |row| {
            row.status = OutboxStatus::Pending;
        })
        .await
    }

    async fn count_by_status(&self) -> OutboxResult<StatusCounts> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for row in &state.rows {
            counts.add(row.status, 1);
        }
        Ok(counts)
    }

    async fn fetch_unforwarded(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let forwarded = self.state.lock().await.forwarded.clone();
        self.select(limit, move |row| !forwarded.contains(&row.id)).await
    }

    async fn mark_forwarded(&self, id: Uuid, _forwarded_at: DateTime<Utc>) -> OutboxResult<bool> {
        let mut state = self.state.lock().await;
        if !state.rows.iter().any(|row| row.id == id) {
            return Ok(false);
        }
        Ok(state.forwarded.insert(id))
    }
}
