//! HTTP delivery seam

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::time::Duration;

use crate::error::{TransportError, WebhookError, WebhookResult};
use crate::notifier::RESPONSE_EXCERPT_LIMIT;

pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";
pub const HEADER_IDEMPOTENCY_KEY: &str = "X-Idempotency-Key";

/// Response bytes read for the audit excerpt; covers its character limit in any UTF-8 text
pub const MAX_RESPONSE_BYTES: usize = RESPONSE_EXCERPT_LIMIT * 4;

/// One signed POST
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub signature: String,
    pub event_type: String,
    pub idempotency_key: String,
}

/// Whatever the endpoint answered, 2xx or not. `body` may be a prefix of what was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// `Err` only when no HTTP response was obtained
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

/// `reqwest` client with a per-request timeout that never follows redirects
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> WebhookResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;

        Ok(Self { client })
    }

    fn headers(request: &WebhookRequest) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in [
            (HEADER_SIGNATURE, &request.signature),
            (HEADER_EVENT_TYPE, &request.event_type),
            (HEADER_IDEMPOTENCY_KEY, &request.idempotency_key),
        ] {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Request(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Request(format!("invalid {name} header: {e}")))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| TransportError::InvalidUrl {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;

        let response = self
            .client
            .post(url)
            .headers(Self::headers(request)?)
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = read_body_prefix(response, &request.url).await;

        Ok(WebhookResponse { status, body })
    }
}

/// At most [`MAX_RESPONSE_BYTES`] of the body; the rest is never buffered
///
/// A body that fails mid-read keeps what arrived. The status is already known,
/// so the attempt's outcome does not depend on the body.
async fn read_body_prefix(mut response: reqwest::Response, url: &str) -> String {
    let mut body: Vec<u8> = Vec::new();

    while body.len() < MAX_RESPONSE_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_RESPONSE_BYTES - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to read webhook response body");
                break;
            }
        }
    }

    String::from_utf8_lossy(&body).into_owned()
}
