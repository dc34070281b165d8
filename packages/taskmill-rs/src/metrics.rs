//! Metric catalog and recorder plumbing.
//!
//! The catalog is an immutable table of every metric the platform emits,
//! exposed read-only so dashboards and the control-plane exporter agree on
//! names and units. Recording goes through [`MetricRecorder`]; the tracing
//! recorder serves development and tests, the server crate adds a
//! minute-bucketed SQL recorder.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Unit of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Count,
    Milliseconds,
    Rows,
}

/// One catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub name: &'static str,
    pub unit: MetricUnit,
    pub description: &'static str,
}

/// Every metric the platform emits.
pub const CATALOG: &[MetricDef] = &[
    MetricDef {
        name: "outbox.claimed",
        unit: MetricUnit::Rows,
        description: "Outbox rows claimed per dispatcher pass",
    },
    MetricDef {
        name: "outbox.dispatched",
        unit: MetricUnit::Rows,
        description: "Outbox rows acked per dispatcher pass",
    },
    MetricDef {
        name: "outbox.poisoned",
        unit: MetricUnit::Rows,
        description: "Outbox rows moved to poisoned",
    },
    MetricDef {
        name: "inbox.ingested",
        unit: MetricUnit::Count,
        description: "Accepted inbound events (including duplicates)",
    },
    MetricDef {
        name: "inbox.processed",
        unit: MetricUnit::Rows,
        description: "Inbox rows completed by the background worker",
    },
    MetricDef {
        name: "scheduler.runs_materialized",
        unit: MetricUnit::Rows,
        description: "Job runs created by the leader",
    },
    MetricDef {
        name: "scheduler.timers_fired",
        unit: MetricUnit::Rows,
        description: "Timers emitted to the outbox",
    },
    MetricDef {
        name: "fanout.slices_emitted",
        unit: MetricUnit::Rows,
        description: "Fanout slices enqueued",
    },
    MetricDef {
        name: "work_queue.reaped",
        unit: MetricUnit::Rows,
        description: "Expired claims released by the reaper",
    },
    MetricDef {
        name: "worker.loop_latency",
        unit: MetricUnit::Milliseconds,
        description: "One claim-process-ack pass",
    },
];

/// Look up a catalog entry by name.
pub fn metric(name: &str) -> Option<&'static MetricDef> {
    CATALOG.iter().find(|def| def.name == name)
}

/// Destination for metric points.
#[async_trait]
pub trait MetricRecorder: Send + Sync {
    async fn record(&self, name: &'static str, value: f64, at: DateTime<Utc>);
}

/// Emits points as structured log events. Development and test default.
#[derive(Default)]
pub struct TracingRecorder;

#[async_trait]
impl MetricRecorder for TracingRecorder {
    async fn record(&self, name: &'static str, value: f64, at: DateTime<Utc>) {
        tracing::debug!(metric = name, value, at = %at, "metric");
    }
}

/// Recorder that drops everything.
#[derive(Default)]
pub struct NullRecorder;

#[async_trait]
impl MetricRecorder for NullRecorder {
    async fn record(&self, _name: &'static str, _value: f64, _at: DateTime<Utc>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique() {
        let mut names: Vec<_> = CATALOG.iter().map(|d| d.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
    }

    #[test]
    fn lookup_finds_known_metric() {
        let def = metric("outbox.claimed").unwrap();
        assert_eq!(def.unit, MetricUnit::Rows);
        assert!(metric("not.a.metric").is_none());
    }
}
