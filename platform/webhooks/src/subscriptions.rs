use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::WebhookResult;

/// An external endpoint registered for one event type
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub event_type: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_active: bool,
}

// Keep secrets out of logs.
impl std::fmt::Debug for WebhookSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSubscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("url", &self.url)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

impl WebhookSubscription {
    pub fn new(event_type: impl Into<String>, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            url: url.into(),
            secret: secret.into(),
            is_active: true,
        }
    }
}

/// Read-only view of subscription configuration
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_active_by_event_type(&self, event_type: &str) -> WebhookResult<Vec<WebhookSubscription>>;

    /// Any subscription by id, active or not
    async fn find(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>>;
}

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_active_by_event_type(&self, event_type: &str) -> WebhookResult<Vec<WebhookSubscription>> {
        let subscriptions = sqlx::query_as::<_, WebhookSubscription>(
            r#"
            SELECT id, event_type, url, secret, is_active
            FROM webhook_subscriptions
            WHERE event_type = $1 AND is_active = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn find(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>> {
        let subscription = sqlx::query_as::<_, WebhookSubscription>(
            "SELECT id, event_type, url, secret, is_active FROM webhook_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: Arc<RwLock<Vec<WebhookSubscription>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, subscription: WebhookSubscription) {
        self.subscriptions.write().await.push(subscription);
    }

    pub async fn deactivate(&self, id: Uuid) {
        if let Some(subscription) = self.subscriptions.write().await.iter_mut().find(|s| s.id == id) {
            subscription.is_active = false;
        }
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_active_by_event_type(&self, event_type: &str) -> WebhookResult<Vec<WebhookSubscription>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.is_active && s.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn find(&self, id: Uuid) -> WebhookResult<Option<WebhookSubscription>> {
        Ok(self.subscriptions.read().await.iter().find(|s| s.id == id).cloned())
    }
}
