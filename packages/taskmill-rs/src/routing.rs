//! Multi-database routing: discovery, providers, router, selection.
//!
//! One process can run the platform against many application databases
//! ("tenants"). Discovery produces the set of store descriptors, a provider
//! materializes component stores per descriptor, the router resolves a
//! tenant key to its store, and a selection strategy decides which store a
//! cross-database worker polls next.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TaskmillError;

/// Stable identifier of one backing database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(pub String);

impl StoreKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StoreKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One discovered database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub key: StoreKey,
    pub connection_string: String,
}

/// External source of the current database set.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<StoreDescriptor>>;
}

/// Fixed set supplied at startup.
#[derive(Debug)]
pub struct StaticDiscovery {
    descriptors: Vec<StoreDescriptor>,
}

impl StaticDiscovery {
    /// Duplicate keys are a configuration error.
    pub fn new(descriptors: Vec<StoreDescriptor>) -> Result<Self, TaskmillError> {
        let mut seen = std::collections::HashSet::new();
        for d in &descriptors {
            if !seen.insert(d.key.clone()) {
                return Err(TaskmillError::config(format!(
                    "duplicate store name {:?} in static discovery",
                    d.key.as_str()
                )));
            }
        }
        Ok(Self { descriptors })
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<StoreDescriptor>> {
        Ok(self.descriptors.clone())
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Builds one component store for a descriptor. The same factory is reused
/// when a descriptor's connection string changes, producing a replacement
/// instance.
pub trait StoreFactory<T: ?Sized>: Send + Sync {
    fn build(&self, descriptor: &StoreDescriptor) -> anyhow::Result<Arc<T>>;
}

impl<T: ?Sized, F> StoreFactory<T> for F
where
    F: Fn(&StoreDescriptor) -> anyhow::Result<Arc<T>> + Send + Sync,
{
    fn build(&self, descriptor: &StoreDescriptor) -> anyhow::Result<Arc<T>> {
        self(descriptor)
    }
}

struct ProviderEntry<T: ?Sized> {
    descriptor: StoreDescriptor,
    store: Arc<T>,
}

/// The live set of per-database store instances for one component.
///
/// Refreshing against the discovery source diffs keys: added descriptors
/// build new instances, removed ones are dropped, and a changed connection
/// string replaces the instance. A refresh error keeps the current set; an
/// empty discovery result empties it, which producers observe as
/// "no stores".
pub struct StoreProvider<T: ?Sized> {
    factory: Arc<dyn StoreFactory<T>>,
    discovery: Arc<dyn DiscoverySource>,
    entries: std::sync::RwLock<HashMap<StoreKey, ProviderEntry<T>>>,
}

impl<T: ?Sized> StoreProvider<T> {
    pub fn new(discovery: Arc<dyn DiscoverySource>, factory: Arc<dyn StoreFactory<T>>) -> Self {
        Self {
            factory,
            discovery,
            entries: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Build a provider and run the first refresh so producers start with a
    /// populated set.
    pub async fn bootstrap(
        discovery: Arc<dyn DiscoverySource>,
        factory: Arc<dyn StoreFactory<T>>,
    ) -> anyhow::Result<Self> {
        let provider = Self::new(discovery, factory);
        provider.refresh().await?;
        Ok(provider)
    }

    /// Re-discover and apply the diff. Errors from the discovery source are
    /// returned after logging; the current set stays live.
    pub async fn refresh(&self) -> anyhow::Result<RefreshDiff> {
        let discovered = match self.discovery.discover().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "store discovery refresh failed; keeping current set");
                return Err(e);
            }
        };

        let mut diff = RefreshDiff::default();
        let mut entries = self.entries.write().unwrap();

        let discovered_keys: std::collections::HashSet<_> =
            discovered.iter().map(|d| d.key.clone()).collect();
        let removed: Vec<StoreKey> = entries
            .keys()
            .filter(|k| !discovered_keys.contains(*k))
            .cloned()
            .collect();
        for key in removed {
            entries.remove(&key);
            diff.removed.push(key);
        }

        for descriptor in discovered {
            match entries.get(&descriptor.key) {
                Some(existing) if existing.descriptor == descriptor => {}
                Some(_) => {
                    let store = self.factory.build(&descriptor)?;
                    diff.replaced.push(descriptor.key.clone());
                    entries.insert(
                        descriptor.key.clone(),
                        ProviderEntry { descriptor, store },
                    );
                }
                None => {
                    let store = self.factory.build(&descriptor)?;
                    diff.added.push(descriptor.key.clone());
                    entries.insert(
                        descriptor.key.clone(),
                        ProviderEntry { descriptor, store },
                    );
                }
            }
        }

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                replaced = diff.replaced.len(),
                "store discovery refresh applied"
            );
        }
        Ok(diff)
    }

    pub fn keys(&self) -> Vec<StoreKey> {
        let mut keys: Vec<_> = self.entries.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &StoreKey) -> Option<Arc<T>> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .map(|e| Arc::clone(&e.store))
    }

    pub fn all(&self) -> Vec<(StoreKey, Arc<T>)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, e)| (k.clone(), Arc::clone(&e.store)))
            .collect();
        all.sort_by(|(a, _), (b, _)| a.cmp(b));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a refresh cycle changed.
#[derive(Debug, Default)]
pub struct RefreshDiff {
    pub added: Vec<StoreKey>,
    pub removed: Vec<StoreKey>,
    pub replaced: Vec<StoreKey>,
}

impl RefreshDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Resolves a tenant/store key to the component instance.
///
/// With exactly one store registered, `resolve_single` auto-resolves it.
/// With multiple stores the router must be used explicitly by key;
/// `resolve_single` fails by design so a multi-database deployment cannot
/// silently collapse onto one database.
pub struct Router<T: ?Sized> {
    provider: Arc<StoreProvider<T>>,
}

impl<T: ?Sized> Router<T> {
    pub fn new(provider: Arc<StoreProvider<T>>) -> Self {
        Self { provider }
    }

    pub fn resolve(&self, key: &StoreKey) -> Result<Arc<T>, TaskmillError> {
        self.provider.get(key).ok_or_else(|| {
            TaskmillError::invalid_input(format!("no store registered for key {:?}", key.as_str()))
        })
    }

    pub fn resolve_single(&self) -> Result<Arc<T>, TaskmillError> {
        let all = self.provider.all();
        match all.len() {
            0 => Err(TaskmillError::config(
                "no stores registered; discovery returned an empty set",
            )),
            1 => Ok(Arc::clone(&all[0].1)),
            n => Err(TaskmillError::config(format!(
                "{n} stores registered; the single-store accessor cannot be used, resolve by key"
            ))),
        }
    }
}

// =============================================================================
// Selection strategies
// =============================================================================

/// Policy for choosing which store a cross-database worker polls next.
///
/// `select_next` receives the number of items the previous selection
/// processed (0 on the first call) and returns the next key, or `None` when
/// no stores exist. `reset` returns to the head.
pub trait SelectionStrategy: Send {
    fn select_next(&mut self, previous_processed: usize) -> Option<StoreKey>;
    fn reset(&mut self);
    fn update_keys(&mut self, keys: Vec<StoreKey>);
}

/// Deterministic cycle over the key set.
pub struct RoundRobin {
    keys: Vec<StoreKey>,
    next: usize,
}

impl RoundRobin {
    pub fn new(keys: Vec<StoreKey>) -> Self {
        Self { keys, next: 0 }
    }
}

impl SelectionStrategy for RoundRobin {
    fn select_next(&mut self, _previous_processed: usize) -> Option<StoreKey> {
        if self.keys.is_empty() {
            return None;
        }
        let key = self.keys[self.next % self.keys.len()].clone();
        self.next = (self.next + 1) % self.keys.len();
        Some(key)
    }

    fn reset(&mut self) {
        self.next = 0;
    }

    fn update_keys(&mut self, keys: Vec<StoreKey>) {
        self.keys = keys;
        self.next = 0;
    }
}

/// Stay on the current store while it keeps producing work; advance when it
/// runs dry, wrapping at the end.
pub struct DrainFirst {
    keys: Vec<StoreKey>,
    current: usize,
    started: bool,
}

impl DrainFirst {
    pub fn new(keys: Vec<StoreKey>) -> Self {
        Self {
            keys,
            current: 0,
            started: false,
        }
    }
}

impl SelectionStrategy for DrainFirst {
    fn select_next(&mut self, previous_processed: usize) -> Option<StoreKey> {
        if self.keys.is_empty() {
            return None;
        }
        if !self.started {
            self.started = true;
        } else if previous_processed == 0 {
            self.current = (self.current + 1) % self.keys.len();
        }
        Some(self.keys[self.current].clone())
    }

    fn reset(&mut self) {
        self.current = 0;
        self.started = false;
    }

    fn update_keys(&mut self, keys: Vec<StoreKey>) {
        self.keys = keys;
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<StoreKey> {
        names.iter().map(|n| StoreKey::from(*n)).collect()
    }

    struct FlakySource {
        calls: std::sync::atomic::AtomicUsize,
        sets: Vec<anyhow::Result<Vec<StoreDescriptor>>>,
    }

    #[async_trait]
    impl DiscoverySource for FlakySource {
        async fn discover(&self) -> anyhow::Result<Vec<StoreDescriptor>> {
            let i = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match self.sets.get(i.min(self.sets.len() - 1)) {
                Some(Ok(set)) => Ok(set.clone()),
                Some(Err(e)) => Err(anyhow::anyhow!("{e}")),
                None => Ok(Vec::new()),
            }
        }
    }

    fn descriptor(key: &str, conn: &str) -> StoreDescriptor {
        StoreDescriptor {
            key: StoreKey::from(key),
            connection_string: conn.to_string(),
        }
    }

    fn string_factory() -> Arc<dyn StoreFactory<String>> {
        Arc::new(|d: &StoreDescriptor| Ok(Arc::new(d.connection_string.clone())))
    }

    #[test]
    fn static_discovery_rejects_duplicates() {
        let err = StaticDiscovery::new(vec![
            descriptor("Customer1", "a"),
            descriptor("Customer1", "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, TaskmillError::Config(_)));
    }

    #[tokio::test]
    async fn refresh_applies_add_and_remove_diff() {
        let source = Arc::new(FlakySource {
            calls: Default::default(),
            sets: vec![
                Ok(vec![descriptor("Customer1", "a")]),
                Ok(vec![descriptor("Customer1", "a"), descriptor("Customer2", "b")]),
                Ok(vec![descriptor("Customer2", "b")]),
            ],
        });
        let provider = StoreProvider::bootstrap(source, string_factory())
            .await
            .unwrap();
        assert_eq!(provider.keys(), keys(&["Customer1"]));

        let diff = provider.refresh().await.unwrap();
        assert_eq!(diff.added, keys(&["Customer2"]));
        assert!(diff.removed.is_empty());
        assert_eq!(provider.keys(), keys(&["Customer1", "Customer2"]));

        let diff = provider.refresh().await.unwrap();
        assert_eq!(diff.removed, keys(&["Customer1"]));
        assert_eq!(provider.keys(), keys(&["Customer2"]));
    }

    #[tokio::test]
    async fn connection_string_change_replaces_instance() {
        let source = Arc::new(FlakySource {
            calls: Default::default(),
            sets: vec![
                Ok(vec![descriptor("Customer1", "conn-a")]),
                Ok(vec![descriptor("Customer1", "conn-b")]),
            ],
        });
        let provider = StoreProvider::bootstrap(source, string_factory())
            .await
            .unwrap();
        let before = provider.get(&StoreKey::from("Customer1")).unwrap();
        assert_eq!(*before, "conn-a");

        let diff = provider.refresh().await.unwrap();
        assert_eq!(diff.replaced, keys(&["Customer1"]));
        let after = provider.get(&StoreKey::from("Customer1")).unwrap();
        assert_eq!(*after, "conn-b");
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn refresh_error_keeps_current_set() {
        let source = Arc::new(FlakySource {
            calls: Default::default(),
            sets: vec![
                Ok(vec![descriptor("Customer1", "a")]),
                Err(anyhow::anyhow!("discovery endpoint down")),
            ],
        });
        let provider = StoreProvider::bootstrap(source, string_factory())
            .await
            .unwrap();
        assert!(provider.refresh().await.is_err());
        assert_eq!(provider.keys(), keys(&["Customer1"]));
    }

    #[tokio::test]
    async fn single_store_auto_resolves_and_multi_fails() {
        let source = Arc::new(FlakySource {
            calls: Default::default(),
            sets: vec![
                Ok(vec![descriptor("Customer1", "a")]),
                Ok(vec![descriptor("Customer1", "a"), descriptor("Customer2", "b")]),
            ],
        });
        let provider = Arc::new(
            StoreProvider::bootstrap(source, string_factory())
                .await
                .unwrap(),
        );
        let router = Router::new(Arc::clone(&provider));
        assert_eq!(*router.resolve_single().unwrap(), "a");

        provider.refresh().await.unwrap();
        assert!(matches!(
            router.resolve_single(),
            Err(TaskmillError::Config(_))
        ));
        assert_eq!(*router.resolve(&StoreKey::from("Customer2")).unwrap(), "b");
    }

    #[test]
    fn round_robin_is_fair() {
        let mut strategy = RoundRobin::new(keys(&["a", "b", "c"]));
        let mut counts: HashMap<StoreKey, usize> = HashMap::new();
        for _ in 0..12 {
            let key = strategy.select_next(5).unwrap();
            *counts.entry(key).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c == 4));
    }

    #[test]
    fn round_robin_reset_returns_to_head() {
        let mut strategy = RoundRobin::new(keys(&["a", "b"]));
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "a");
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "b");
        strategy.reset();
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "a");
    }

    #[test]
    fn drain_first_sticks_while_producing() {
        let mut strategy = DrainFirst::new(keys(&["a", "b"]));
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "a");
        assert_eq!(strategy.select_next(5).unwrap().as_str(), "a");
        assert_eq!(strategy.select_next(3).unwrap().as_str(), "a");
        // Ran dry: advance.
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "b");
        assert_eq!(strategy.select_next(2).unwrap().as_str(), "b");
        // Wrap at the end.
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "a");
    }

    #[test]
    fn drain_first_reset_returns_to_head() {
        let mut strategy = DrainFirst::new(keys(&["a", "b", "c"]));
        strategy.select_next(0);
        strategy.select_next(0);
        strategy.reset();
        assert_eq!(strategy.select_next(0).unwrap().as_str(), "a");
    }

    #[test]
    fn empty_key_set_selects_nothing() {
        let mut rr = RoundRobin::new(Vec::new());
        assert!(rr.select_next(0).is_none());
        let mut df = DrainFirst::new(Vec::new());
        assert!(df.select_next(0).is_none());
    }
}
