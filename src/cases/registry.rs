//! # Extension registry: typed factories with create-or-fetch semantics.
//!
//! Pluggable pieces of a run (orderers, reporters, custom sinks) are registered
//! as factory functions under a stable identifier. The first
//! [`get_or_create`](ExtensionRegistry::get_or_create) for an identifier builds
//! the instance; later calls return a clone of it.
//!
//! ```text
//! register("orderer/default", || Arc::new(DefaultTestCaseOrderer) as Arc<dyn TestCaseOrderer>)
//!            │
//! get_or_create::<Arc<dyn TestCaseOrderer>>("orderer/default")
//!            ├─ cached?  ──► clone
//!            └─ factory() ─► cache (first writer wins) ─► clone
//! ```
//!
//! ## Rules
//! - A registry is owned by one run; nothing is process-wide.
//! - Re-registering an identifier replaces its factory and drops any cached instance.
//! - Factories run without the registry lock held, so they may resolve other extensions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RunnerError;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;

#[derive(Default)]
struct Entries {
    factories: HashMap<String, Factory>,
    instances: HashMap<String, Instance>,
}

/// Per-run registry of extension factories.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: Mutex<Entries>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `id`; returns `true` if it replaced another.
    pub fn register<T, F>(&self, id: impl Into<String>, factory: F) -> bool
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let id = id.into();
        let factory: Factory = Arc::new(move || Arc::new(factory()) as Instance);
        let mut entries = self.lock();
        entries.instances.remove(&id);
        entries.factories.insert(id, factory).is_some()
    }

    /// Whether `id` has a factory.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().factories.contains_key(id)
    }

    /// Returns the instance for `id`, creating it on first use.
    pub fn get_or_create<T>(&self, id: &str) -> Result<T, RunnerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let factory = {
            let entries = self.lock();
            if let Some(instance) = entries.instances.get(id) {
                return downcast(id, instance);
            }
            entries
                .factories
                .get(id)
                .cloned()
                .ok_or_else(|| RunnerError::Extension {
                    id: id.to_string(),
                    reason: "no factory registered".into(),
                })?
        };

        let created = factory();
        let mut entries = self.lock();
        let instance = entries
            .instances
            .entry(id.to_string())
            .or_insert(created);
        downcast(id, instance)
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn downcast<T: Clone + 'static>(id: &str, instance: &Instance) -> Result<T, RunnerError> {
    instance
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| RunnerError::Extension {
            id: id.to_string(),
            reason: format!("registered type is not {}", std::any::type_name::<T>()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::{DefaultTestCaseOrderer, TestCaseDescriptor, TestCaseOrderer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn creates_once_then_fetches() {
        let registry = ExtensionRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));
        let b = Arc::clone(&built);
        registry.register("orderer/default", move || {
            b.fetch_add(1, Ordering::SeqCst);
            Arc::new(DefaultTestCaseOrderer) as Arc<dyn TestCaseOrderer>
        });

        let first: Arc<dyn TestCaseOrderer> = registry.get_or_create("orderer/default").unwrap();
        let second: Arc<dyn TestCaseOrderer> = registry.get_or_create("orderer/default").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let case = TestCaseDescriptor::new("c", "c");
        assert_eq!(first.order(&[&case]).unwrap(), vec![0]);
    }

    #[test]
    fn unknown_and_mistyped_lookups_fail() {
        let registry = ExtensionRegistry::new();
        registry.register("answer", || 42u32);

        assert_eq!(
            registry.get_or_create::<u32>("missing").unwrap_err().as_label(),
            "runner_extension"
        );
        assert!(registry.get_or_create::<String>("answer").is_err());
        assert_eq!(registry.get_or_create::<u32>("answer").unwrap(), 42);
    }

    #[test]
    fn reregistering_drops_cached_instance() {
        let registry = ExtensionRegistry::new();
        assert!(!registry.register("name", || String::from("one")));
        assert_eq!(registry.get_or_create::<String>("name").unwrap(), "one");

        assert!(registry.register("name", || String::from("two")));
        assert_eq!(registry.get_or_create::<String>("name").unwrap(), "two");
    }

    #[test]
    fn registries_do_not_share_state() {
        let a = ExtensionRegistry::new();
        let b = ExtensionRegistry::new();
        a.register("x", || 1u8);
        assert!(a.contains("x"));
        assert!(!b.contains("x"));
    }
}
