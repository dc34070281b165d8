//! Stable wire formats for inbox and fanout messages.
//!
//! These shapes are serialized as JSON with camelCase field names and are
//! treated as stable: downstream consumers parse them across deployments.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The raw inbound delivery, captured before any parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub provider: String,
    pub received_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body_bytes_base64: String,
}

impl WebhookEnvelope {
    pub fn encode_body(body: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(body)
    }

    pub fn decode_body(&self) -> anyhow::Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.body_bytes_base64)?)
    }
}

/// A classified, accepted event as stored and re-published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventRecord {
    pub provider: String,
    pub dedupe_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_event_id: Option<String>,
    pub event_type: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub content_type: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// One emitted fanout window for one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutSlice {
    pub fanout_topic: String,
    pub shard_key: String,
    pub work_key: String,
    pub window_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_body_roundtrips_base64() {
        let body = b"{\"hello\":\"world\"}";
        let envelope = WebhookEnvelope {
            provider: "stripe".into(),
            received_at: Utc::now(),
            method: "POST".into(),
            path: "/webhooks/stripe".into(),
            query: None,
            headers: vec![("content-type".into(), "application/json".into())],
            content_type: Some("application/json".into()),
            body_bytes_base64: WebhookEnvelope::encode_body(body),
        };
        assert_eq!(envelope.decode_body().unwrap(), body);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let slice = FanoutSlice {
            fanout_topic: "billing".into(),
            shard_key: "shard-3".into(),
            work_key: "invoices".into(),
            window_start: Utc::now(),
            correlation_id: None,
        };
        let json = serde_json::to_value(&slice).unwrap();
        assert!(json.get("fanoutTopic").is_some());
        assert!(json.get("shardKey").is_some());
        assert!(json.get("workKey").is_some());
        assert!(json.get("windowStart").is_some());
        // Absent correlation id is omitted, not null.
        assert!(json.get("correlationId").is_none());
    }

    #[test]
    fn event_record_roundtrips() {
        let record = WebhookEventRecord {
            provider: "github".into(),
            dedupe_key: "github:evt-1".into(),
            provider_event_id: Some("evt-1".into()),
            event_type: "push".into(),
            headers: vec![("x-github-event".into(), "push".into())],
            body: serde_json::json!({"ref": "main"}),
            content_type: Some("application/json".into()),
            received_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: WebhookEventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
