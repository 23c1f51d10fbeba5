//! # Test-case ordering.
//!
//! Cases run in an order that is arbitrary (not insertion order) yet
//! repeatable: the [`DefaultTestCaseOrderer`] sorts by a SipHash of the unique
//! ID, breaking hash ties by the ID string itself.
//!
//! [`order_test_cases`] applies any [`TestCaseOrderer`] and falls back to a
//! random shuffle if the orderer fails, panics or returns something that is
//! not a permutation.

use std::cmp::Ordering;
use std::hash::Hasher;
use std::panic::{AssertUnwindSafe, catch_unwind};

use rand::seq::SliceRandom;
use siphasher::sip::SipHasher13;

use super::descriptor::TestCaseDescriptor;
use crate::error::{RunnerError, panic_message};

/// Decides the run order of a set of cases.
pub trait TestCaseOrderer: Send + Sync {
    /// Returns a permutation of `0..cases.len()`.
    fn order(&self, cases: &[&TestCaseDescriptor]) -> Result<Vec<usize>, RunnerError>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Stable hash-based order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTestCaseOrderer;

impl DefaultTestCaseOrderer {
    fn key(unique_id: &str) -> u64 {
        let mut hasher = SipHasher13::new();
        hasher.write(unique_id.as_bytes());
        hasher.finish()
    }
}

impl TestCaseOrderer for DefaultTestCaseOrderer {
    fn order(&self, cases: &[&TestCaseDescriptor]) -> Result<Vec<usize>, RunnerError> {
        let mut keyed: Vec<(u64, usize)> = cases
            .iter()
            .enumerate()
            .map(|(idx, case)| (Self::key(&case.unique_id), idx))
            .collect();
        keyed.sort_by(|(ha, ia), (hb, ib)| {
            ha.cmp(hb)
                .then_with(|| cases[*ia].unique_id.cmp(&cases[*ib].unique_id))
                .then_with(|| ia.cmp(ib))
        });
        Ok(keyed.into_iter().map(|(_, idx)| idx).collect())
    }

    fn name(&self) -> &'static str {
        "DefaultTestCaseOrderer"
    }
}

/// Cases in run order, plus the orderer failure if the fallback was used.
#[derive(Debug)]
pub struct OrderedCases<T> {
    /// Cases in the order they should run.
    pub cases: Vec<T>,
    /// Set when the orderer failed and the order is random.
    pub error: Option<RunnerError>,
}

/// Orders `cases` with `orderer`; `descriptor` projects each item to its descriptor.
pub fn order_test_cases<T>(
    orderer: &dyn TestCaseOrderer,
    cases: Vec<T>,
    descriptor: impl Fn(&T) -> &TestCaseDescriptor,
) -> OrderedCases<T> {
    let order = {
        let views: Vec<&TestCaseDescriptor> = cases.iter().map(|c| descriptor(c)).collect();
        catch_unwind(AssertUnwindSafe(|| orderer.order(&views)))
            .unwrap_or_else(|p| {
                Err(RunnerError::OrderingFailed {
                    reason: format!("orderer panicked: {}", panic_message(p.as_ref())),
                })
            })
            .and_then(|order| validate(order, views.len()))
    };

    match order {
        Ok(order) => OrderedCases {
            cases: permute(cases, &order),
            error: None,
        },
        Err(e) => {
            tracing::warn!(orderer = orderer.name(), error = %e, "falling back to random test case order");
            let mut cases = cases;
            cases.shuffle(&mut rand::thread_rng());
            OrderedCases {
                cases,
                error: Some(e),
            }
        }
    }
}

fn validate(order: Vec<usize>, len: usize) -> Result<Vec<usize>, RunnerError> {
    let mut seen = vec![false; len];
    if order.len() != len {
        return Err(RunnerError::OrderingFailed {
            reason: format!("returned {} positions for {len} cases", order.len()),
        });
    }
    for &idx in &order {
        match seen.get_mut(idx) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                return Err(RunnerError::OrderingFailed {
                    reason: format!("position {idx} is out of range or repeated"),
                });
            }
        }
    }
    Ok(order)
}

fn permute<T>(cases: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = cases.into_iter().map(Some).collect();
    order.iter().filter_map(|&idx| slots[idx].take()).collect()
}

/// Compares two descriptors the way [`DefaultTestCaseOrderer`] does.
pub fn default_order(a: &TestCaseDescriptor, b: &TestCaseDescriptor) -> Ordering {
    DefaultTestCaseOrderer::key(&a.unique_id)
        .cmp(&DefaultTestCaseOrderer::key(&b.unique_id))
        .then_with(|| a.unique_id.cmp(&b.unique_id))
}
