//! Receiving side: verify, parse, de-duplicate

use event_consumer::IdempotencyStore;

use crate::error::VerificationError;
use crate::payload::WebhookPayload;
use crate::signing;

#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    /// First time this idempotency key was seen; act on it
    Accepted(WebhookPayload),
    /// Already handled; respond 2xx without acting again
    AlreadyProcessed(WebhookPayload),
}

/// Verify and de-duplicate an inbound webhook
///
/// The signature is recomputed over `raw_body` exactly as received, before
/// any parsing. De-duplication keys on the payload's `idempotency_key`.
pub async fn accept_webhook(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: &str,
    guard: &dyn IdempotencyStore,
) -> Result<Receipt, VerificationError> {
    let signature = signature_header
        .filter(|s| !s.trim().is_empty())
        .ok_or(VerificationError::MissingSignature)?;
    signing::verify(secret, raw_body, signature)?;

    let payload: WebhookPayload = serde_json::from_slice(raw_body)
        .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
    let snapshot = serde_json::to_value(&payload)
        .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

    let marked = guard
        .try_mark_processed(&payload.idempotency_key, &payload.event, &snapshot)
        .await?;

    if marked.already_processed {
        tracing::info!(
            idempotency_key = %payload.idempotency_key,
            event_type = %payload.event,
            "Duplicate webhook ignored"
        );
        Ok(Receipt::AlreadyProcessed(payload))
    } else {
        Ok(Receipt::Accepted(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::WebhookMetadata;
    use event_consumer::InMemoryIdempotencyStore;
    use serde_json::json;
    use uuid::Uuid;

    fn body() -> Vec<u8> {
        WebhookPayload {
            event: "vehicle_type.deleted".to_string(),
            version: "1.0".to_string(),
            id: Uuid::new_v4(),
            idempotency_key: "vehicle_type.deleted-vt-1-abc".to_string(),
            timestamp: 1_700_000_000_000,
            data: json!({"id": "vt-1"}),
            metadata: WebhookMetadata {
                source: "vehicle-types".to_string(),
                environment: "test".to_string(),
            },
        }
        .to_bytes()
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_webhook_accepted_once() {
        let guard = InMemoryIdempotencyStore::new();
        let body = body();
        let signature = signing::sign("s3cr3t", &body).unwrap();

        let first = accept_webhook(&body, Some(&signature), "s3cr3t", &guard).await.unwrap();
        let second = accept_webhook(&body, Some(&signature), "s3cr3t", &guard).await.unwrap();

        assert!(matches!(first, Receipt::Accepted(_)));
        assert!(matches!(second, Receipt::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn test_missing_or_bad_signature_rejected_before_marking() {
        let guard = InMemoryIdempotencyStore::new();
        let body = body();

        let missing = accept_webhook(&body, None, "s3cr3t", &guard).await;
        let wrong = accept_webhook(&body, Some("00ff"), "s3cr3t", &guard).await;

        assert!(matches!(missing, Err(VerificationError::MissingSignature)));
        assert!(matches!(wrong, Err(VerificationError::InvalidSignature)));
        assert!(guard.is_empty().await);
    }

    #[tokio::test]
    async fn test_signed_garbage_is_malformed() {
        let guard = InMemoryIdempotencyStore::new();
        let body = b"[1,2,3]".to_vec();
        let signature = signing::sign("s3cr3t", &body).unwrap();

        let result = accept_webhook(&body, Some(&signature), "s3cr3t", &guard).await;

        assert!(matches!(result, Err(VerificationError::MalformedPayload(_))));
    }
}
