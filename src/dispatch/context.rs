//! # Ambient execution context snapshots.
//!
//! An [`ExecutionContext`] is an immutable value holding what must flow from the
//! thread that posts work to the thread that runs it: the culture name and the
//! logical call-context values.
//!
//! ```text
//! caller thread                      worker thread
//!   ExecutionContext::capture() ──►   ctx.run(|| callback())
//!   (snapshot, cheap clone)           (installs ctx, restores previous after)
//! ```
//!
//! Installation is scoped: the previous context is restored when the closure
//! returns or unwinds.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::default());
}

/// Snapshot of ambient state captured at post time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    culture: Option<Arc<str>>,
    values: Arc<BTreeMap<String, String>>,
}

impl ExecutionContext {
    /// Captures the calling thread's current context.
    pub fn capture() -> Self {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Returns a copy with the culture set.
    pub fn with_culture(mut self, culture: impl Into<Arc<str>>) -> Self {
        self.culture = Some(culture.into());
        self
    }

    /// Returns a copy with one logical call-context value set.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value.into());
        self
    }

    /// Culture name, if any.
    pub fn culture(&self) -> Option<&str> {
        self.culture.as_deref()
    }

    /// Logical call-context value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Runs `f` with this context installed on the current thread.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT.with(|c| c.replace(self.clone()));
        let _restore = Restore(Some(previous));
        f()
    }
}

struct Restore(Option<ExecutionContext>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            CURRENT.with(|c| *c.borrow_mut() = previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_installs_and_restores() {
        assert_eq!(ExecutionContext::capture(), ExecutionContext::default());

        let ctx = ExecutionContext::default()
            .with_culture("fr-FR")
            .with_value("request", "42");
        let seen = ctx.run(ExecutionContext::capture);
        assert_eq!(seen.culture(), Some("fr-FR"));
        assert_eq!(seen.get("request"), Some("42"));

        assert_eq!(ExecutionContext::capture(), ExecutionContext::default());
    }

    #[test]
    fn nested_runs_restore_outer() {
        let outer = ExecutionContext::default().with_culture("en-US");
        let inner = ExecutionContext::default().with_culture("de-DE");
        outer.run(|| {
            inner.run(|| assert_eq!(ExecutionContext::capture().culture(), Some("de-DE")));
            assert_eq!(ExecutionContext::capture().culture(), Some("en-US"));
        });
    }

    #[test]
    fn restored_after_panic() {
        let ctx = ExecutionContext::default().with_culture("ja-JP");
        let res = std::panic::catch_unwind(|| ctx.run(|| panic!("boom")));
        assert!(res.is_err());
        assert_eq!(ExecutionContext::capture().culture(), None);
    }

    #[test]
    fn with_value_does_not_mutate_shared_snapshot() {
        let base = ExecutionContext::default().with_value("a", "1");
        let derived = base.clone().with_value("b", "2");
        assert_eq!(base.get("b"), None);
        assert_eq!(derived.get("a"), Some("1"));
    }
}
