//! Long-running service hosting with cooperative shutdown.
//!
//! Every worker in the process implements [`Service`]. The host runs them
//! all, links each to one shutdown token, and waits for them to drain when
//! the process is told to stop. A service returning an error is logged; it
//! does not take the process down.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background service.
#[async_trait::async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` fires. Implementations stop claiming new work on
    /// cancellation, let in-flight work finish or time out, and return.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs a set of services until shutdown.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token linked to every hosted service. Cancel to stop them all.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn all services and wait for them to finish after `shutdown`
    /// fires.
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            info!(service = name, "starting service");
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                }
                info!(service = name, "service stopped");
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Run until ctrl-c, then propagate shutdown and drain.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
        self.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Flagger {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Service for Flagger {
        fn name(&self) -> &'static str {
            "flagger"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn services_observe_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = ServiceHost::new().with_service(Flagger {
            stopped: stopped.clone(),
        });
        let token = host.shutdown_token();
        let run = tokio::spawn(host.run());
        token.cancel();
        run.await.unwrap().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
