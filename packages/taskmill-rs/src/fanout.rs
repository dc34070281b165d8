//! Periodic per-shard slice emission.
//!
//! A fanout worker holds a lease per fanout topic. On each tick it walks the
//! known shards, computes the next emission window per shard cursor, and
//! enqueues one outbox message per elapsed window so downstream processors
//! can partition their work. Catch-up after downtime is bounded by
//! `max_catchup_windows`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::FanoutSlice;
use crate::id::CorrelationId;

/// Emission policy for one fanout topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutPolicy {
    pub fanout_topic: String,
    /// Cron tick schedule; when absent, `default_every_seconds` drives the
    /// tick with `random(0..jitter_seconds)` added.
    pub cron: Option<String>,
    pub default_every_seconds: i64,
    pub jitter_seconds: i64,
    /// Lease duration for the per-topic lease, in seconds.
    pub lease_seconds: i64,
    /// Distinguishes multiple kinds of work fanned out under one topic.
    pub work_key: Option<String>,
    /// Bound on elapsed windows emitted in one tick after downtime.
    pub max_catchup_windows: u32,
}

impl FanoutPolicy {
    pub fn every(topic: impl Into<String>, every_seconds: i64) -> Self {
        Self {
            fanout_topic: topic.into(),
            cron: None,
            default_every_seconds: every_seconds,
            jitter_seconds: 0,
            lease_seconds: 60,
            work_key: None,
            max_catchup_windows: 8,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.default_every_seconds.max(1))
    }

    /// Sleep before the next tick: the interval plus uniform jitter.
    pub fn next_tick_delay(&self) -> std::time::Duration {
        let jitter = if self.jitter_seconds > 0 {
            fastrand::i64(0..=self.jitter_seconds)
        } else {
            0
        };
        std::time::Duration::from_secs((self.default_every_seconds.max(1) + jitter) as u64)
    }

    /// Outbox topic slices are published on.
    pub fn slice_topic(&self) -> String {
        match &self.work_key {
            Some(work_key) => format!("fanout:{}:{}", self.fanout_topic, work_key),
            None => format!("fanout:{}:default", self.fanout_topic),
        }
    }
}

/// Per-shard emission cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutCursor {
    pub fanout_topic: String,
    pub shard_key: String,
    pub last_emitted_window_start: Option<DateTime<Utc>>,
}

/// Truncate `at` down to a window boundary.
pub fn floor_to_interval(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.num_seconds().max(1);
    let ts = at.timestamp();
    let floored = ts - ts.rem_euclid(secs);
    DateTime::<Utc>::from_timestamp(floored, 0).unwrap_or(at)
}

/// Windows elapsed for one shard since its cursor, oldest first.
///
/// The first candidate is `max(cursor + interval, floor(now, interval))`
/// so a long-idle cursor does not replay history beyond the catch-up bound;
/// emission then walks forward while the window start has been reached.
pub fn elapsed_windows(
    cursor: &FanoutCursor,
    interval: Duration,
    now: DateTime<Utc>,
    max_catchup: u32,
) -> Vec<DateTime<Utc>> {
    let floor_now = floor_to_interval(now, interval);
    let mut window = match cursor.last_emitted_window_start {
        Some(last) => (last + interval).max(floor_now - interval * (max_catchup as i32 - 1).max(0)),
        None => floor_now,
    };
    let mut out = Vec::new();
    while window <= now && out.len() < max_catchup as usize {
        out.push(window);
        window += interval;
    }
    out
}

/// Build the slice payload for one emitted window.
pub fn slice_for(
    policy: &FanoutPolicy,
    shard_key: &str,
    window_start: DateTime<Utc>,
    correlation_id: CorrelationId,
) -> FanoutSlice {
    FanoutSlice {
        fanout_topic: policy.fanout_topic.clone(),
        shard_key: shard_key.to_string(),
        work_key: policy
            .work_key
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        window_start,
        correlation_id: correlation_id.as_optional(),
    }
}

/// Store contract for fanout policies and cursors.
#[async_trait]
pub trait FanoutStore: Send + Sync {
    async fn list_policies(&self) -> anyhow::Result<Vec<FanoutPolicy>>;

    async fn upsert_policy(&self, policy: FanoutPolicy) -> anyhow::Result<()>;

    /// Shard keys currently known for a topic.
    async fn shards(&self, fanout_topic: &str) -> anyhow::Result<Vec<String>>;

    /// Make a shard known for a topic. Registering an existing shard is a
    /// no-op.
    async fn register_shard(&self, fanout_topic: &str, shard_key: &str) -> anyhow::Result<()>;

    async fn cursor(&self, fanout_topic: &str, shard_key: &str) -> anyhow::Result<FanoutCursor>;

    /// Advance the cursor iff it still matches `expected_previous`
    /// (compare-and-set; concurrent ticks must not double-emit).
    async fn advance_cursor(
        &self,
        fanout_topic: &str,
        shard_key: &str,
        expected_previous: Option<DateTime<Utc>>,
        new_window_start: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cursor(topic: &str, last: Option<DateTime<Utc>>) -> FanoutCursor {
        FanoutCursor {
            fanout_topic: topic.into(),
            shard_key: "shard-0".into(),
            last_emitted_window_start: last,
        }
    }

    #[test]
    fn floor_truncates_to_boundary() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 42).unwrap();
        let floored = floor_to_interval(at, Duration::minutes(5));
        assert_eq!(floored, Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn fresh_cursor_emits_current_window_only() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 0).unwrap();
        let windows = elapsed_windows(&cursor("t", None), Duration::minutes(5), now, 8);
        assert_eq!(
            windows,
            vec![Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap()]
        );
    }

    #[test]
    fn idle_cursor_catches_up_in_order() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 16, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let windows = elapsed_windows(&cursor("t", Some(last)), Duration::minutes(5), now, 8);
        assert_eq!(
            windows,
            vec![
                Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 1, 10, 10, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn catchup_is_bounded() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(); // a day behind
        let windows = elapsed_windows(&cursor("t", Some(last)), Duration::minutes(5), now, 4);
        assert_eq!(windows.len(), 4);
        // The bounded window set ends at "now", not at the stale cursor.
        assert_eq!(*windows.last().unwrap(), now);
    }

    #[test]
    fn up_to_date_cursor_emits_nothing() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap();
        let windows = elapsed_windows(&cursor("t", Some(last)), Duration::minutes(5), now, 8);
        assert!(windows.is_empty());
    }

    #[test]
    fn slice_topic_includes_work_key() {
        let mut policy = FanoutPolicy::every("billing", 300);
        assert_eq!(policy.slice_topic(), "fanout:billing:default");
        policy.work_key = Some("invoices".into());
        assert_eq!(policy.slice_topic(), "fanout:billing:invoices");
    }
}
