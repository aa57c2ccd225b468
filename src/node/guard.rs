//! Run guards carried down through [`ExecutionContext`](super::ExecutionContext).
//!
//! A flow checks these between node transitions. Nested flows inherit the
//! guards of every enclosing flow and of the runner, so a limit set at the top
//! also bounds the work done inside sub-flows.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Point in time after which no new node may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    /// Deadline `limit` from now
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    /// The time limit this deadline was set from
    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Whichever of the two expires first
    pub fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.at < a.at { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

/// Number of node steps a run may take, nested flows included.
///
/// Clones share one counter, so steps taken by a sub-flow are charged to
/// every budget it inherited.
#[derive(Debug, Clone)]
pub struct StepBudget {
    limit: usize,
    used: Arc<AtomicUsize>,
}

impl StepBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Record one node step
    pub(crate) fn charge(&self) {
        self.used.fetch_add(1, Ordering::SeqCst);
    }
}
