//! Test-case descriptors, ordering and per-run extension registration.
//!
//! - [`TestCaseDescriptor`]: identity of a case plus its command-line-safe token form.
//! - [`TestCaseOrderer`] / [`DefaultTestCaseOrderer`] / [`order_test_cases`]: repeatable run order.
//! - [`ExtensionRegistry`]: typed factories keyed by a stable identifier.

mod descriptor;
mod order;
mod registry;

pub use descriptor::TestCaseDescriptor;
pub use order::{
    DefaultTestCaseOrderer, OrderedCases, TestCaseOrderer, default_order, order_test_cases,
};
pub use registry::ExtensionRegistry;
