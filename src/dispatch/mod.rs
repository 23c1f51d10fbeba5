//! Bounded-concurrency execution of test work.
//!
//! - [`BoundedDispatcher`]: fixed pool of dedicated worker threads.
//! - [`DispatcherHandle`]: cloneable handle used to post work.
//! - [`ExecutionContext`]: ambient state snapshot carried with each work item.
//! - [`AsyncOperationTracker`]: awaits detached async work started by a test.

mod context;
mod dispatcher;
mod tracker;

pub use context::ExecutionContext;
pub use dispatcher::{BoundedDispatcher, DispatcherHandle};
pub use tracker::AsyncOperationTracker;
