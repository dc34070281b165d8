//! Handler registration and dispatch by topic / event type.
//!
//! Registration maps a key to one or more handlers. The outbox dispatcher
//! uses one handler per topic; webhook fanout allows several handlers per
//! event type, each receiving the same record.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerOutcome;

/// Context passed to every handler invocation.
///
/// The cancellation token's deadline tracks the claim lease minus a safety
/// margin; handlers that ignore it risk their work being reaped mid-flight.
#[derive(Clone)]
pub struct HandlerContext {
    pub cancel: CancellationToken,
    pub attempt: u32,
}

impl HandlerContext {
    pub fn new(cancel: CancellationToken, attempt: u32) -> Self {
        Self { cancel, attempt }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn for_test() -> Self {
        Self {
            cancel: CancellationToken::new(),
            attempt: 0,
        }
    }
}

/// A handler for one message payload.
///
/// Returning an `Err` is treated as [`HandlerOutcome::Transient`] with no
/// explicit delay. Handlers that can prove permanence should return
/// [`HandlerOutcome::Permanent`] instead.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &serde_json::Value,
        ctx: &HandlerContext,
    ) -> anyhow::Result<HandlerOutcome>;
}

/// Adapter so closures can be registered directly in tests and wiring code.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    async fn handle(
        &self,
        payload: &serde_json::Value,
        ctx: &HandlerContext,
    ) -> anyhow::Result<HandlerOutcome> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}

/// Registry of handlers keyed by topic or event type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `key`. Multiple handlers per key are allowed;
    /// they run in registration order.
    pub fn register(&self, key: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(key.into()).or_default().push(handler);
    }

    pub fn register_fn<F, Fut>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
    {
        self.register(key, Arc::new(FnHandler(f)));
    }

    /// All handlers for `key`, empty when none are registered.
    pub fn handlers_for(&self, key: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn has_handler(&self, key: &str) -> bool {
        self.handlers
            .get(key)
            .map(|entry| !entry.value().is_empty())
            .unwrap_or(false)
    }

    pub fn registered_keys(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn registered_handler_is_invoked() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        registry.register_fn("orders.created", move |_payload, _ctx| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Success)
            }
        });

        let handlers = registry.handlers_for("orders.created");
        assert_eq!(handlers.len(), 1);
        let outcome = handlers[0]
            .handle(&serde_json::json!({}), &HandlerContext::for_test())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_handlers_per_key_run_in_order() {
        let registry = HandlerRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            registry.register_fn("hook", move |_payload, _ctx| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(tag);
                    Ok(HandlerOutcome::Success)
                }
            });
        }

        for handler in registry.handlers_for("hook") {
            handler
                .handle(&serde_json::json!({}), &HandlerContext::for_test())
                .await
                .unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn unknown_key_has_no_handlers() {
        let registry = HandlerRegistry::new();
        assert!(!registry.has_handler("nope"));
        assert!(registry.handlers_for("nope").is_empty());
    }
}
