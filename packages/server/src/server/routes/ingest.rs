//! Webhook ingest route.
//!
//! The body is taken as raw bytes and handed to the ingestor untouched;
//! authentication happens on exactly what arrived on the wire.

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Json;

use crate::ingest::RawDelivery;
use crate::server::app::AppState;

pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let delivery = RawDelivery {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers: header_pairs,
        content_type,
        body: body.to_vec(),
    };

    let response = state.ingestor.ingest(&provider, delivery).await;
    (
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(response.body),
    )
}
