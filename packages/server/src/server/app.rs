//! Application setup and router construction.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use taskmill::health::HealthRegistry;

use crate::ingest::WebhookIngestor;

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<WebhookIngestor>,
    pub health: HealthRegistry,
}

/// Build the HTTP application: webhook ingest plus the three health
/// buckets.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/:provider", post(crate::server::routes::webhook_handler))
        .route("/healthz", get(crate::server::routes::healthz_handler))
        .route("/readyz", get(crate::server::routes::readyz_handler))
        .route("/health/dep", get(crate::server::routes::dep_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
