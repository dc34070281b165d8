//! Bucketed health endpoints.
//!
//! `GET /healthz` evaluates the `live` bucket (never gated by startup),
//! `GET /readyz` the `ready` bucket (gated by the startup latch check),
//! `GET /health/dep` the dependency bucket. Any unhealthy check maps to
//! 503; degraded-only maps to 200 with status "Degraded".

use axum::{extract::State, http::StatusCode, Json};

use taskmill::health::{evaluate_bucket, BucketReport, HealthBucket};

use crate::server::app::AppState;

pub async fn healthz_handler(State(state): State<AppState>) -> (StatusCode, Json<BucketReport>) {
    bucket_response(&state, HealthBucket::Live).await
}

pub async fn readyz_handler(State(state): State<AppState>) -> (StatusCode, Json<BucketReport>) {
    bucket_response(&state, HealthBucket::Ready).await
}

pub async fn dep_handler(State(state): State<AppState>) -> (StatusCode, Json<BucketReport>) {
    bucket_response(&state, HealthBucket::Dep).await
}

async fn bucket_response(
    state: &AppState,
    bucket: HealthBucket,
) -> (StatusCode, Json<BucketReport>) {
    let report = evaluate_bucket(&state.health, bucket).await;
    let status =
        StatusCode::from_u16(report.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(report))
}
