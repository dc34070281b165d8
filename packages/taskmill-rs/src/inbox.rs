//! Idempotent ingestion of external events.
//!
//! Ingestion splits into a fast-ack path and a background processing path.
//!
//! Fast path: verify the signature on the untouched raw body, classify the
//! event, upsert on the `(source, message_id)` dedupe key, return 2xx
//! immediately. Duplicates refresh `last_seen_utc` and return the same
//! accepted outcome, so provider retries are harmless.
//!
//! Background path: the shared work-queue engine claims pending rows,
//! handlers selected by event type run under the exactly-once executor keyed
//! by the dedupe key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::TaskmillError;
use crate::work_item::{WorkItem, WorkQueue};

// =============================================================================
// Dedupe key
// =============================================================================

/// The primary idempotency key for inbound events.
///
/// Preferred form is `provider:providerEventId`. When the provider does not
/// supply a stable event id the key falls back to `provider:sha256(body)`,
/// which is weak: two deliveries of semantically-equal events with different
/// byte bodies dedupe as distinct. The provider name is part of the key, not
/// of the hash input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    pub source: String,
    pub message_id: String,
}

impl DedupeKey {
    pub fn from_event_id(provider: &str, event_id: &str) -> Self {
        Self {
            source: provider.to_string(),
            message_id: event_id.to_string(),
        }
    }

    /// Weak fallback keyed on the body hash.
    pub fn from_body_hash(provider: &str, body: &[u8]) -> Self {
        let digest = Sha256::digest(body);
        Self {
            source: provider.to_string(),
            message_id: format!("sha256:{}", hex::encode(digest)),
        }
    }

    pub fn is_hash_fallback(&self) -> bool {
        self.message_id.starts_with("sha256:")
    }
}

impl std::fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.message_id)
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// Verifies provider signatures over the untouched raw body.
///
/// Implementations must compare in constant time and must not parse or
/// re-serialize the body before verifying.
pub trait IngestAuthenticator: Send + Sync {
    fn verify(&self, body: &[u8], headers: &[(String, String)]) -> Result<(), TaskmillError>;
}

/// HMAC-SHA256 authenticator reading the hex signature from a header, with
/// an optional timestamp header bounded by a skew window.
pub struct HmacSha256Authenticator {
    secret: Vec<u8>,
    signature_header: String,
    timestamp_header: Option<String>,
    max_skew: chrono::Duration,
}

impl HmacSha256Authenticator {
    pub fn new(secret: impl Into<Vec<u8>>, signature_header: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            signature_header: signature_header.into().to_ascii_lowercase(),
            timestamp_header: None,
            max_skew: chrono::Duration::minutes(5),
        }
    }

    pub fn with_timestamp_header(mut self, header: impl Into<String>) -> Self {
        self.timestamp_header = Some(header.into().to_ascii_lowercase());
        self
    }

    pub fn with_max_skew(mut self, skew: chrono::Duration) -> Self {
        self.max_skew = skew;
        self
    }

    fn header<'a>(&self, headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn compute_signature(&self, body: &[u8]) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl IngestAuthenticator for HmacSha256Authenticator {
    fn verify(&self, body: &[u8], headers: &[(String, String)]) -> Result<(), TaskmillError> {
        let presented = self
            .header(headers, &self.signature_header)
            .ok_or_else(|| TaskmillError::AuthRejected("missing signature header".into()))?;

        if let Some(ts_header) = &self.timestamp_header {
            let raw = self
                .header(headers, ts_header)
                .ok_or_else(|| TaskmillError::AuthRejected("missing timestamp header".into()))?;
            let secs: i64 = raw
                .parse()
                .map_err(|_| TaskmillError::AuthRejected("unparseable timestamp".into()))?;
            let sent = DateTime::<Utc>::from_timestamp(secs, 0)
                .ok_or_else(|| TaskmillError::AuthRejected("timestamp out of range".into()))?;
            let skew = (Utc::now() - sent).abs();
            if skew > self.max_skew {
                return Err(TaskmillError::AuthRejected(format!(
                    "timestamp outside skew window ({skew})"
                )));
            }
        }

        let expected = self.compute_signature(body);
        let matches: bool = expected
            .as_bytes()
            .ct_eq(presented.trim().to_ascii_lowercase().as_bytes())
            .into();
        if matches {
            Ok(())
        } else {
            Err(TaskmillError::AuthRejected("signature mismatch".into()))
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// What the classifier decided about an inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestDecision {
    /// Store and process.
    Accepted {
        event_type: String,
        provider_event_id: Option<String>,
        dedupe_key: DedupeKey,
    },
    /// Recognized but deliberately dropped (ping events, unsubscribed
    /// types). Still a 2xx to the provider.
    Ignored { reason: String },
    /// Unrecognized or malformed. Not stored by default.
    Rejected { reason: String },
}

/// Derives `(provider_event_id, event_type, dedupe_key)` from a delivery.
pub trait IngestClassifier: Send + Sync {
    fn provider(&self) -> &str;

    fn classify(&self, body: &[u8], headers: &[(String, String)]) -> IngestDecision;
}

/// Classifier for providers that post JSON with `type` and `id` fields.
///
/// `type == "ping"` is ignored, a missing or non-JSON body is rejected,
/// and the dedupe key prefers the `id` field with the body-hash fallback.
/// Provider-specific parsers live outside the platform and implement
/// [`IngestClassifier`] themselves; this covers the common shape.
pub struct JsonFieldClassifier {
    provider: String,
}

impl JsonFieldClassifier {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl IngestClassifier for JsonFieldClassifier {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn classify(&self, body: &[u8], _headers: &[(String, String)]) -> IngestDecision {
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
            return IngestDecision::Rejected {
                reason: "body is not valid JSON".into(),
            };
        };
        match json.get("type").and_then(|t| t.as_str()) {
            Some("ping") => IngestDecision::Ignored {
                reason: "ping event".into(),
            },
            Some(event_type) => {
                let event_id = json.get("id").and_then(|i| i.as_str());
                let dedupe_key = match event_id {
                    Some(id) => DedupeKey::from_event_id(&self.provider, id),
                    None => DedupeKey::from_body_hash(&self.provider, body),
                };
                IngestDecision::Accepted {
                    event_type: event_type.to_string(),
                    provider_event_id: event_id.map(String::from),
                    dedupe_key,
                }
            }
            None => IngestDecision::Rejected {
                reason: "missing event type".into(),
            },
        }
    }
}

/// What to keep when a delivery is rejected. Configuration of the ingestor,
/// not of the inbox table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionRetention {
    /// Drop rejected deliveries entirely.
    #[default]
    None,
    /// Persist the full envelope.
    Envelope,
    /// Persist headers and metadata with the body redacted.
    MetadataOnly,
}

// =============================================================================
// Inbox rows
// =============================================================================

/// A stored inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub item: WorkItem,
    /// `(source, message_id)` is the composite unique dedupe key.
    pub source: String,
    pub message_id: String,
    pub event_type: String,
    /// SHA-256 of the raw body; the weak fallback identity.
    pub hash: String,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
    pub attempts: i32,
}

/// Result of the fast-path upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestResult {
    /// First sighting; a new row exists in `Pending`.
    Stored(Uuid),
    /// Duplicate `(source, message_id)`; `last_seen_utc` was refreshed and
    /// nothing else changed.
    DuplicateSeen(Uuid),
}

impl IngestResult {
    pub fn row_id(&self) -> Uuid {
        match self {
            IngestResult::Stored(id) | IngestResult::DuplicateSeen(id) => *id,
        }
    }
}

/// Payload for the fast-path write.
#[derive(Debug, Clone)]
pub struct NewInboxEvent {
    pub dedupe_key: DedupeKey,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub body_hash: String,
}

impl NewInboxEvent {
    pub fn new(
        dedupe_key: DedupeKey,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        headers: serde_json::Value,
        body: &[u8],
    ) -> Self {
        Self {
            dedupe_key,
            event_type: event_type.into(),
            payload,
            headers,
            body_hash: hex::encode(Sha256::digest(body)),
        }
    }
}

/// Store contract for one database's inbox. Claiming and state transitions
/// come from the shared [`WorkQueue`] operations.
#[async_trait]
pub trait InboxStore: WorkQueue {
    /// Insert-or-touch on the dedupe key.
    async fn ingest(&self, event: NewInboxEvent) -> anyhow::Result<IngestResult>;

    async fn load(&self, ids: &[Uuid]) -> anyhow::Result<Vec<InboxRecord>>;

    async fn get_by_key(&self, key: &DedupeKey) -> anyhow::Result<Option<InboxRecord>>;

    /// Rows first seen before `older_than` that have not reached a terminal
    /// state. The watchdog alerts on these.
    async fn stuck_count(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_prefers_event_id() {
        let key = DedupeKey::from_event_id("stripe", "evt_123");
        assert_eq!(key.to_string(), "stripe:evt_123");
        assert!(!key.is_hash_fallback());
    }

    #[test]
    fn fallback_key_hashes_body_only() {
        let a = DedupeKey::from_body_hash("stripe", b"{\"n\":1}");
        let b = DedupeKey::from_body_hash("github", b"{\"n\":1}");
        // Same body, different provider: distinct keys, identical hash part.
        assert_ne!(a, b);
        assert_eq!(a.message_id, b.message_id);
        assert!(a.is_hash_fallback());
    }

    #[test]
    fn hmac_verifies_valid_signature() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let body = b"payload-bytes";
        let sig = auth.compute_signature(body);
        let headers = vec![("x-signature".to_string(), sig)];
        assert!(auth.verify(body, &headers).is_ok());
    }

    #[test]
    fn hmac_rejects_tampered_body() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let sig = auth.compute_signature(b"original");
        let headers = vec![("x-signature".to_string(), sig)];
        let err = auth.verify(b"tampered", &headers).unwrap_err();
        assert!(matches!(err, TaskmillError::AuthRejected(_)));
    }

    #[test]
    fn hmac_rejects_missing_header() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let err = auth.verify(b"body", &[]).unwrap_err();
        assert!(matches!(err, TaskmillError::AuthRejected(_)));
    }

    #[test]
    fn hmac_rejects_stale_timestamp() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature")
            .with_timestamp_header("X-Timestamp")
            .with_max_skew(chrono::Duration::minutes(5));
        let body = b"body";
        let sig = auth.compute_signature(body);
        let old = (Utc::now() - chrono::Duration::hours(2)).timestamp();
        let headers = vec![
            ("x-signature".to_string(), sig),
            ("x-timestamp".to_string(), old.to_string()),
        ];
        let err = auth.verify(body, &headers).unwrap_err();
        assert!(matches!(err, TaskmillError::AuthRejected(_)));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let auth = HmacSha256Authenticator::new(b"secret".to_vec(), "X-Signature");
        let body = b"body";
        let headers = vec![("X-SIGNATURE".to_string(), auth.compute_signature(body))];
        assert!(auth.verify(body, &headers).is_ok());
    }
}
