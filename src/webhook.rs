use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::params::WorkflowJob;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

type HmacSha256 = Hmac<Sha256>;

/// Verifies `X-Hub-Signature-256` against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> Result<()> {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .ok_or(Error::Unauthorized)?;
    let expected = hex::decode(hex_digest).map_err(|_| Error::Unauthorized)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| Error::Unauthorized)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| Error::Unauthorized)
}

/// Bounded FIFO set of recently seen delivery ids. A delivery is recorded
/// only after its event was accepted, so failed deliveries may retry.
pub struct DeliveryLog {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        DeliveryLog {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, delivery_id: &str) -> bool {
        self.seen.contains(delivery_id)
    }

    pub fn record(&mut self, delivery_id: &str) {
        if !self.seen.insert(delivery_id.to_string()) {
            return;
        }
        self.order.push_back(delivery_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub controller: Controller,
    pub deliveries: Arc<Mutex<DeliveryLog>>,
}

impl WebhookState {
    pub fn new(controller: Controller, dedup_window: usize) -> Self {
        WebhookState {
            controller,
            deliveries: Arc::new(Mutex::new(DeliveryLog::new(dedup_window))),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /webhook`. Acks 200 once the event has been routed; the actual
/// reconciliation happens on the manager's workers.
#[instrument(skip_all, fields(delivery = header(&headers, DELIVERY_HEADER).unwrap_or("-")))]
pub async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match header(&headers, EVENT_HEADER) {
        Some("workflow_job") => {}
        Some(other) => {
            tracing::debug!(event = other, "ignoring unrelated webhook event");
            return StatusCode::OK.into_response();
        }
        None => return (StatusCode::BAD_REQUEST, "missing event header").into_response(),
    }

    let delivery_id = header(&headers, DELIVERY_HEADER).map(str::to_string);
    if let Some(delivery_id) = &delivery_id {
        if state.deliveries.lock().await.contains(delivery_id) {
            tracing::debug!("duplicate delivery, acking without effect");
            return StatusCode::OK.into_response();
        }
    }

    let job: WorkflowJob = match serde_json::from_slice(&body) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(error = %e, "malformed workflow_job payload");
            return (StatusCode::BAD_REQUEST, "malformed payload").into_response();
        }
    };

    let manager = match state.controller.find_for_job(&job).await {
        Ok(manager) => manager,
        Err(e) => return e.into_response(),
    };

    let secret = manager.webhook_secret().await;
    if let Some(signature) = header(&headers, SIGNATURE_HEADER) {
        if let Err(e) = verify_signature(&secret, &body, signature) {
            tracing::warn!("webhook signature mismatch");
            return e.into_response();
        }
    } else {
        return Error::Unauthorized.into_response();
    }

    if let Err(e) = manager.handle_workflow_job(&job).await {
        tracing::error!(error = %e, "handling workflow job failed");
        return e.into_response();
    }

    if let Some(delivery_id) = &delivery_id {
        state.deliveries.lock().await.record(delivery_id);
    }
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"action":"queued"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &header).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("topsecret", b"payload");
        let err = verify_signature("topsecret", b"other payload", &header).unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let header = sign("topsecret", body);
        assert!(verify_signature("not-the-secret", body, &header).is_err());
    }

    #[test]
    fn malformed_header_fails() {
        assert!(verify_signature("s", b"x", "sha1=abcd").is_err());
        assert!(verify_signature("s", b"x", "sha256=zz").is_err());
        assert!(verify_signature("s", b"x", "").is_err());
    }

    #[test]
    fn delivery_log_is_bounded_fifo() {
        let mut log = DeliveryLog::new(2);
        log.record("a");
        log.record("b");
        assert!(log.contains("a") && log.contains("b"));
        log.record("c");
        assert!(!log.contains("a"));
        assert!(log.contains("b") && log.contains("c"));
    }
}
