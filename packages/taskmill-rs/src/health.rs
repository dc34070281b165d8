//! Health checks, buckets, and per-status caching.
//!
//! Checks are grouped into buckets by tag: `live` (process liveness,
//! never gated by startup), `ready` (gated by the startup latch), and `dep`
//! (dependency aggregation). Endpoint status mapping: any unhealthy check
//! makes the bucket unhealthy (503); any degraded check with nothing
//! unhealthy reports "Degraded" with a 200; otherwise "Healthy".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

/// Result status of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

/// Bucket a check is exposed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthBucket {
    Live,
    Ready,
    Dep,
}

impl HealthBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthBucket::Live => "live",
            HealthBucket::Ready => "ready",
            HealthBucket::Dep => "dep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(HealthBucket::Live),
            "ready" => Some(HealthBucket::Ready),
            "dep" => Some(HealthBucket::Dep),
            _ => None,
        }
    }
}

/// Outcome of one check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CheckResult {
    pub fn healthy(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: description.into(),
            data: None,
        }
    }

    pub fn degraded(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            description: description.into(),
            data: None,
        }
    }

    pub fn unhealthy(description: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            description: description.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One named health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> CheckResult;
}

/// A check registered into one or more buckets.
#[derive(Clone)]
pub struct RegisteredCheck {
    pub check: Arc<dyn HealthCheck>,
    pub buckets: Vec<HealthBucket>,
}

/// The set of checks an endpoint evaluates.
#[derive(Default, Clone)]
pub struct HealthRegistry {
    checks: Vec<RegisteredCheck>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, check: Arc<dyn HealthCheck>, buckets: &[HealthBucket]) -> &mut Self {
        self.checks.push(RegisteredCheck {
            check,
            buckets: buckets.to_vec(),
        });
        self
    }

    pub fn checks_for(&self, bucket: HealthBucket) -> Vec<Arc<dyn HealthCheck>> {
        self.checks
            .iter()
            .filter(|c| c.buckets.contains(&bucket))
            .map(|c| Arc::clone(&c.check))
            .collect()
    }
}

/// One entry in a bucket report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketEntry {
    pub name: String,
    pub status: HealthStatus,
    pub description: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Aggregated result for one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketReport {
    pub bucket: HealthBucket,
    pub status: HealthStatus,
    pub total_duration_ms: u64,
    pub checks: Vec<BucketEntry>,
}

impl BucketReport {
    /// HTTP status the endpoint returns for this report.
    pub fn http_status(&self) -> u16 {
        match self.status {
            HealthStatus::Unhealthy => 503,
            _ => 200,
        }
    }
}

/// Run every check registered for `bucket` and aggregate.
pub async fn evaluate_bucket(registry: &HealthRegistry, bucket: HealthBucket) -> BucketReport {
    let started = std::time::Instant::now();
    let mut entries = Vec::new();
    let mut status = HealthStatus::Healthy;

    for check in registry.checks_for(bucket) {
        let check_started = std::time::Instant::now();
        let result = check.check().await;
        status = status.worst(result.status);
        entries.push(BucketEntry {
            name: check.name().to_string(),
            status: result.status,
            description: result.description,
            duration_ms: check_started.elapsed().as_millis() as u64,
            data: result.data,
        });
    }

    BucketReport {
        bucket,
        status,
        total_duration_ms: started.elapsed().as_millis() as u64,
        checks: entries,
    }
}

// =============================================================================
// Cached check
// =============================================================================

/// Per-status TTLs for [`CachedHealthCheck`]. A zero duration means
/// "do not cache this status".
#[derive(Debug, Clone)]
pub struct CacheDurations {
    pub healthy: Duration,
    pub degraded: Duration,
    pub unhealthy: Duration,
}

impl Default for CacheDurations {
    fn default() -> Self {
        Self {
            healthy: Duration::from_secs(30),
            degraded: Duration::from_secs(10),
            unhealthy: Duration::from_secs(0),
        }
    }
}

impl CacheDurations {
    fn ttl_for(&self, status: HealthStatus) -> Duration {
        match status {
            HealthStatus::Healthy => self.healthy,
            HealthStatus::Degraded => self.degraded,
            HealthStatus::Unhealthy => self.unhealthy,
        }
    }
}

struct CachedResult {
    result: CheckResult,
    expires_at: DateTime<Utc>,
}

/// Wraps an inner check with a TTL per status, so hot endpoints do not
/// hammer a slow dependency probe.
pub struct CachedHealthCheck {
    inner: Arc<dyn HealthCheck>,
    durations: CacheDurations,
    clock: SharedClock,
    cached: tokio::sync::Mutex<Option<CachedResult>>,
}

impl CachedHealthCheck {
    pub fn new(inner: Arc<dyn HealthCheck>, durations: CacheDurations, clock: SharedClock) -> Self {
        Self {
            inner,
            durations,
            clock,
            cached: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl HealthCheck for CachedHealthCheck {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn check(&self) -> CheckResult {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > now {
                return entry.result.clone();
            }
        }

        let result = self.inner.check().await;
        let ttl = self.durations.ttl_for(result.status);
        if ttl.is_zero() {
            *cached = None;
        } else {
            *cached = Some(CachedResult {
                result: result.clone(),
                expires_at: now
                    + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCheck {
        calls: AtomicUsize,
        status: std::sync::Mutex<HealthStatus>,
    }

    impl CountingCheck {
        fn new(status: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status: std::sync::Mutex::new(status),
            })
        }
    }

    #[async_trait]
    impl HealthCheck for CountingCheck {
        fn name(&self) -> &str {
            "counting"
        }

        async fn check(&self) -> CheckResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CheckResult {
                status: *self.status.lock().unwrap(),
                description: "counting check".into(),
                data: None,
            }
        }
    }

    #[test]
    fn worst_ordering() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.worst(HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Healthy),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn bucket_filters_by_tag_and_maps_http_status() {
        let mut registry = HealthRegistry::new();
        registry.register(
            CountingCheck::new(HealthStatus::Healthy),
            &[HealthBucket::Live],
        );
        registry.register(
            CountingCheck::new(HealthStatus::Unhealthy),
            &[HealthBucket::Dep],
        );

        let live = evaluate_bucket(&registry, HealthBucket::Live).await;
        assert_eq!(live.checks.len(), 1);
        assert_eq!(live.status, HealthStatus::Healthy);
        assert_eq!(live.http_status(), 200);

        let dep = evaluate_bucket(&registry, HealthBucket::Dep).await;
        assert_eq!(dep.status, HealthStatus::Unhealthy);
        assert_eq!(dep.http_status(), 503);
    }

    #[tokio::test]
    async fn degraded_without_unhealthy_is_200_degraded() {
        let mut registry = HealthRegistry::new();
        registry.register(
            CountingCheck::new(HealthStatus::Healthy),
            &[HealthBucket::Dep],
        );
        registry.register(
            CountingCheck::new(HealthStatus::Degraded),
            &[HealthBucket::Dep],
        );
        let report = evaluate_bucket(&registry, HealthBucket::Dep).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.http_status(), 200);
    }

    #[tokio::test]
    async fn healthy_result_is_cached_within_ttl() {
        let clock = ManualClock::start_now();
        let inner = CountingCheck::new(HealthStatus::Healthy);
        let cached = CachedHealthCheck::new(
            inner.clone(),
            CacheDurations {
                healthy: Duration::from_secs(30),
                degraded: Duration::from_secs(10),
                unhealthy: Duration::from_secs(0),
            },
            Arc::new(clock.clone()),
        );

        cached.check().await;
        cached.check().await;
        cached.check().await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(31));
        cached.check().await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_status_is_never_cached() {
        let clock = ManualClock::start_now();
        let inner = CountingCheck::new(HealthStatus::Unhealthy);
        let cached = CachedHealthCheck::new(
            inner.clone(),
            CacheDurations::default(), // unhealthy TTL is zero
            Arc::new(clock.clone()),
        );

        cached.check().await;
        cached.check().await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bucket_parse_roundtrip() {
        for bucket in [HealthBucket::Live, HealthBucket::Ready, HealthBucket::Dep] {
            assert_eq!(HealthBucket::parse(bucket.as_str()), Some(bucket));
        }
        assert_eq!(HealthBucket::parse("nope"), None);
    }
}
