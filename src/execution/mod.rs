//! In-process execution of test cases.
//!
//! - [`TestCase`] / [`TestCaseFn`] / [`TestContext`]: what runs and what it sees.
//! - [`TestRunner`] / [`RunSummary`]: ordered, bounded, reported execution.

mod case;
mod runner;

pub use case::{TestCase, TestCaseFn, TestCaseRef, TestContext};
pub use runner::{RunSummary, TestRunner};
