//! Startup latch and ordered startup checks.
//!
//! The latch begins ready. Each registered step drops readiness until its
//! guard is dropped; readiness returns only after the last outstanding step
//! completes. The check runner executes named startup checks in ascending
//! order: a critical failure aborts the rest, a non-critical failure logs a
//! warning and continues.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::TaskmillError;
use crate::health::{CheckResult, HealthCheck};

/// Gates readiness until initialization completes.
#[derive(Clone, Default)]
pub struct StartupLatch {
    pending: Arc<AtomicUsize>,
}

impl StartupLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no registered steps are outstanding.
    pub fn is_ready(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// Register a startup step. Readiness is false until the returned guard
    /// is dropped.
    pub fn register(&self, name: impl Into<String>) -> StartupStep {
        let name = name.into();
        self.pending.fetch_add(1, Ordering::SeqCst);
        info!(step = %name, "startup step registered");
        StartupStep {
            name,
            pending: Arc::clone(&self.pending),
            done: AtomicBool::new(false),
        }
    }
}

/// Guard for one registered startup step. Dropping completes the step;
/// double-completion is a no-op.
pub struct StartupStep {
    name: String,
    pending: Arc<AtomicUsize>,
    done: AtomicBool,
}

impl StartupStep {
    /// Complete the step explicitly.
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for StartupStep {
    fn drop(&mut self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            info!(step = %self.name, "startup step complete");
        }
    }
}

/// Health check over the latch: `ready` maps to Healthy("Startup
/// complete"), otherwise Unhealthy("Starting").
pub struct StartupLatchCheck {
    latch: StartupLatch,
}

impl StartupLatchCheck {
    pub fn new(latch: StartupLatch) -> Self {
        Self { latch }
    }
}

#[async_trait]
impl HealthCheck for StartupLatchCheck {
    fn name(&self) -> &str {
        "startup"
    }

    async fn check(&self) -> CheckResult {
        if self.latch.is_ready() {
            CheckResult::healthy("Startup complete")
        } else {
            CheckResult::unhealthy("Starting")
        }
    }
}

// =============================================================================
// Startup check runner
// =============================================================================

/// One named startup check.
#[async_trait]
pub trait StartupCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Lower orders run first.
    fn order(&self) -> i32 {
        0
    }

    /// A failing critical check aborts startup.
    fn critical(&self) -> bool {
        true
    }

    async fn run(&self) -> anyhow::Result<()>;
}

/// Executes startup checks in ascending order.
pub struct StartupCheckRunner {
    checks: Vec<Arc<dyn StartupCheck>>,
}

impl StartupCheckRunner {
    /// Duplicate names are a configuration error.
    pub fn new(checks: Vec<Arc<dyn StartupCheck>>) -> Result<Self, TaskmillError> {
        let mut seen = std::collections::HashSet::new();
        for check in &checks {
            if !seen.insert(check.name().to_string()) {
                return Err(TaskmillError::config(format!(
                    "duplicate startup check name {:?}",
                    check.name()
                )));
            }
        }
        Ok(Self { checks })
    }

    /// Run all checks. A critical failure surfaces immediately; non-critical
    /// failures are logged and skipped.
    pub async fn run_all(&self) -> anyhow::Result<()> {
        let mut ordered = self.checks.clone();
        ordered.sort_by_key(|c| c.order());

        for check in ordered {
            match check.run().await {
                Ok(()) => info!(check = check.name(), "startup check passed"),
                Err(e) if check.critical() => {
                    error!(check = check.name(), error = %e, "critical startup check failed");
                    return Err(e.context(format!("startup check {:?} failed", check.name())));
                }
                Err(e) => {
                    warn!(check = check.name(), error = %e, "non-critical startup check failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn latch_starts_ready() {
        assert!(StartupLatch::new().is_ready());
    }

    #[test]
    fn readiness_drops_on_register_and_returns_after_last_step() {
        let latch = StartupLatch::new();
        let step_a = latch.register("migrations");
        assert!(!latch.is_ready());
        let step_b = latch.register("cache-warm");
        drop(step_a);
        assert!(!latch.is_ready());
        drop(step_b);
        assert!(latch.is_ready());
    }

    #[test]
    fn step_complete_is_idempotent() {
        let latch = StartupLatch::new();
        let step = latch.register("only-once");
        step.complete();
        assert!(latch.is_ready());
        // A second completion cannot happen through the API (the guard is
        // consumed), and Drop after complete is the no-op path.
    }

    #[tokio::test]
    async fn latch_check_maps_to_health() {
        let latch = StartupLatch::new();
        let check = StartupLatchCheck::new(latch.clone());
        assert_eq!(check.check().await.description, "Startup complete");
        let _step = latch.register("step");
        assert_eq!(check.check().await.description, "Starting");
    }

    struct RecordingCheck {
        name: &'static str,
        order: i32,
        critical: bool,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl StartupCheck for RecordingCheck {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn critical(&self) -> bool {
            self.critical
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} failed", self.name)
            }
            Ok(())
        }
    }

    fn check(
        name: &'static str,
        order: i32,
        critical: bool,
        fail: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn StartupCheck> {
        Arc::new(RecordingCheck {
            name,
            order,
            critical,
            fail,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn checks_run_in_ascending_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = StartupCheckRunner::new(vec![
            check("second", 10, true, false, &log),
            check("first", 1, true, false, &log),
            check("third", 20, true, false, &log),
        ])
        .unwrap();
        runner.run_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn critical_failure_aborts_remaining_checks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = StartupCheckRunner::new(vec![
            check("boom", 1, true, true, &log),
            check("never", 2, true, false, &log),
        ])
        .unwrap();
        assert!(runner.run_all().await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["boom"]);
    }

    #[tokio::test]
    async fn non_critical_failure_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = StartupCheckRunner::new(vec![
            check("shaky", 1, false, true, &log),
            check("after", 2, true, false, &log),
        ])
        .unwrap();
        runner.run_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["shaky", "after"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = StartupCheckRunner::new(vec![
            check("dup", 1, true, false, &log),
            check("dup", 2, true, false, &log),
        ]);
        assert!(matches!(result, Err(TaskmillError::Config(_))));
    }
}
