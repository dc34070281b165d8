//! Webhook ingest fast path.
//!
//! Verify the signature on the untouched raw body, classify, upsert on the
//! dedupe key, acknowledge. Everything slow happens later in the inbox
//! worker; the provider gets its 202 as soon as the row is durable.
//! Duplicates return the same accepted response so provider retries
//! converge.
//!
//! Boundary taxonomy: 401 for auth failures, 404 for unknown providers,
//! 422 for rejected events, 503 when the store is unavailable, 2xx for
//! everything accepted or ignored (duplicates included).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use taskmill::clock::SharedClock;
use taskmill::envelope::WebhookEnvelope;
use taskmill::error::TaskmillError;
use taskmill::inbox::{
    InboxStore, IngestAuthenticator, IngestClassifier, IngestDecision, IngestResult,
    NewInboxEvent, RejectionRetention,
};
use taskmill::metrics::MetricRecorder;

/// Where rejected envelopes go when retention is enabled.
#[async_trait]
pub trait RejectedSink: Send + Sync {
    async fn store(&self, envelope: &WebhookEnvelope) -> anyhow::Result<()>;
}

/// The fast-ack response the HTTP layer serializes.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct IngestResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl IngestResponse {
    fn accepted(duplicate: bool) -> Self {
        Self {
            status: 202,
            body: serde_json::json!({ "outcome": "accepted", "duplicate": duplicate }),
        }
    }

    fn ignored(reason: &str) -> Self {
        Self {
            status: 202,
            body: serde_json::json!({ "outcome": "ignored", "reason": reason }),
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            status: 422,
            body: serde_json::json!({ "outcome": "rejected", "reason": reason }),
        }
    }

    fn error(status: u16, reason: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": reason }),
        }
    }
}

/// The raw delivery as the HTTP layer hands it over.
pub struct RawDelivery {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub struct WebhookIngestor {
    authenticator: Arc<dyn IngestAuthenticator>,
    classifiers: HashMap<String, Arc<dyn IngestClassifier>>,
    store: Arc<dyn InboxStore>,
    retention: RejectionRetention,
    rejected_sink: Option<Arc<dyn RejectedSink>>,
    clock: SharedClock,
    metrics: Arc<dyn MetricRecorder>,
}

impl WebhookIngestor {
    pub fn new(
        authenticator: Arc<dyn IngestAuthenticator>,
        classifiers: Vec<Arc<dyn IngestClassifier>>,
        store: Arc<dyn InboxStore>,
        clock: SharedClock,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        let classifiers = classifiers
            .into_iter()
            .map(|c| (c.provider().to_string(), c))
            .collect();
        Self {
            authenticator,
            classifiers,
            store,
            retention: RejectionRetention::None,
            rejected_sink: None,
            clock,
            metrics,
        }
    }

    pub fn with_rejection_retention(
        mut self,
        retention: RejectionRetention,
        sink: Arc<dyn RejectedSink>,
    ) -> Self {
        self.retention = retention;
        self.rejected_sink = Some(sink);
        self
    }

    /// The fast path. Never panics; every exit is a response.
    pub async fn ingest(&self, provider: &str, delivery: RawDelivery) -> IngestResponse {
        let Some(classifier) = self.classifiers.get(provider) else {
            return IngestResponse::error(404, "unknown provider");
        };

        // Authentication runs on the untouched raw body.
        if let Err(e) = self.authenticator.verify(&delivery.body, &delivery.headers) {
            warn!(provider, error = %e, "webhook authentication rejected");
            return IngestResponse::error(401, "authentication rejected");
        }

        match classifier.classify(&delivery.body, &delivery.headers) {
            IngestDecision::Accepted {
                event_type,
                provider_event_id,
                dedupe_key,
            } => {
                debug!(
                    provider,
                    event_type,
                    provider_event_id = provider_event_id.as_deref().unwrap_or("-"),
                    key = %dedupe_key,
                    "webhook accepted"
                );
                let payload = payload_from_body(&delivery.body);
                let headers = serde_json::to_value(&delivery.headers)
                    .unwrap_or(serde_json::Value::Null);
                let event =
                    NewInboxEvent::new(dedupe_key, event_type, payload, headers, &delivery.body);

                match self.store.ingest(event).await {
                    Ok(IngestResult::Stored(_)) => {
                        self.metrics
                            .record("inbox.ingested", 1.0, self.clock.now())
                            .await;
                        IngestResponse::accepted(false)
                    }
                    Ok(IngestResult::DuplicateSeen(_)) => {
                        self.metrics
                            .record("inbox.ingested", 1.0, self.clock.now())
                            .await;
                        IngestResponse::accepted(true)
                    }
                    Err(e) => {
                        warn!(provider, error = %e, "inbox store unavailable");
                        IngestResponse::error(503, "storage unavailable")
                    }
                }
            }
            IngestDecision::Ignored { reason } => {
                debug!(provider, reason = %reason, "webhook ignored");
                IngestResponse::ignored(&reason)
            }
            IngestDecision::Rejected { reason } => {
                warn!(provider, reason = %reason, "webhook rejected");
                self.retain_rejected(provider, &delivery).await;
                IngestResponse::rejected(&reason)
            }
        }
    }

    async fn retain_rejected(&self, provider: &str, delivery: &RawDelivery) {
        let Some(sink) = &self.rejected_sink else { return };
        let envelope = match self.retention {
            RejectionRetention::None => return,
            RejectionRetention::Envelope => WebhookEnvelope {
                provider: provider.to_string(),
                received_at: Utc::now(),
                method: delivery.method.clone(),
                path: delivery.path.clone(),
                query: delivery.query.clone(),
                headers: delivery.headers.clone(),
                content_type: delivery.content_type.clone(),
                body_bytes_base64: WebhookEnvelope::encode_body(&delivery.body),
            },
            RejectionRetention::MetadataOnly => WebhookEnvelope {
                provider: provider.to_string(),
                received_at: Utc::now(),
                method: delivery.method.clone(),
                path: delivery.path.clone(),
                query: delivery.query.clone(),
                headers: delivery.headers.clone(),
                content_type: delivery.content_type.clone(),
                body_bytes_base64: String::new(), // redacted
            },
        };
        if let Err(e) = sink.store(&envelope).await {
            warn!(provider, error = %e, "rejected-event retention failed");
        }
    }
}

/// Parse the body as JSON when possible; otherwise keep it as a string so
/// the background worker still sees something structured.
fn payload_from_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap_or_else(|_| {
        serde_json::json!({ "raw": String::from_utf8_lossy(body) })
    })
}

/// Convenience conversion for taskmill auth errors at the route boundary.
pub fn status_for_error(err: &TaskmillError) -> u16 {
    match err {
        TaskmillError::AuthRejected(_) => 401,
        TaskmillError::InvalidInput(_) => 400,
        TaskmillError::Config(_) => 500,
        TaskmillError::TransientInfrastructure(_) => 503,
        TaskmillError::PermanentDomain(_) => 422,
        TaskmillError::LeaseLost { .. } => 503,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmill::clock::system_clock;
    use taskmill::inbox::{HmacSha256Authenticator, JsonFieldClassifier};
    use taskmill::metrics::NullRecorder;
    use taskmill::testing::InMemoryInbox;

    fn ingestor(
        auth: HmacSha256Authenticator,
    ) -> (WebhookIngestor, Arc<InMemoryInbox>) {
        let store = Arc::new(InMemoryInbox::new(system_clock()));
        let ingestor = WebhookIngestor::new(
            Arc::new(auth),
            vec![Arc::new(JsonFieldClassifier::new("acme"))],
            store.clone(),
            system_clock(),
            Arc::new(NullRecorder),
        );
        (ingestor, store)
    }

    fn delivery(body: &[u8], headers: Vec<(String, String)>) -> RawDelivery {
        RawDelivery {
            method: "POST".into(),
            path: "/webhooks/acme".into(),
            query: None,
            headers,
            content_type: Some("application/json".into()),
            body: body.to_vec(),
        }
    }

    fn signed(auth: &HmacSha256Authenticator, body: &[u8]) -> Vec<(String, String)> {
        vec![("x-signature".to_string(), auth.compute_signature(body))]
    }

    #[tokio::test]
    async fn accepted_event_lands_pending_and_acks_202() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let headers = signed(&auth, br#"{"type":"order.created","id":"evt-1"}"#);
        let (ingestor, store) = ingestor(auth);

        let response = ingestor
            .ingest(
                "acme",
                delivery(br#"{"type":"order.created","id":"evt-1"}"#, headers),
            )
            .await;
        assert_eq!(response.status, 202);
        assert_eq!(response.body["outcome"], "accepted");
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_returns_same_202_one_row() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let body = br#"{"type":"order.created","id":"evt-dup"}"#;
        let headers = signed(&auth, body);
        let (ingestor, store) = ingestor(auth);

        let first = ingestor.ingest("acme", delivery(body, headers.clone())).await;
        let second = ingestor.ingest("acme", delivery(body, headers)).await;
        assert_eq!(first.status, 202);
        assert_eq!(second.status, 202);
        assert_eq!(second.body["duplicate"], true);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn bad_signature_is_401_and_not_stored() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let (ingestor, store) = ingestor(auth);
        let headers = vec![("x-signature".to_string(), "deadbeef".to_string())];

        let response = ingestor
            .ingest("acme", delivery(br#"{"type":"x","id":"1"}"#, headers))
            .await;
        assert_eq!(response.status, 401);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn ping_is_ignored_with_202() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let body = br#"{"type":"ping"}"#;
        let headers = signed(&auth, body);
        let (ingestor, store) = ingestor(auth);

        let response = ingestor.ingest("acme", delivery(body, headers)).await;
        assert_eq!(response.status, 202);
        assert_eq!(response.body["outcome"], "ignored");
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn rejected_is_422_and_unknown_provider_404() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let body = b"not json at all";
        let headers = signed(&auth, body);
        let (ingestor, _) = ingestor(auth);

        let response = ingestor.ingest("acme", delivery(body, headers.clone())).await;
        assert_eq!(response.status, 422);

        let response = ingestor.ingest("nobody", delivery(body, headers)).await;
        assert_eq!(response.status, 404);
    }
}
