//! Shared budget crediting across connections.
//!
//! Several links inside one connection compute reply-budget deltas
//! that are summed into a single shared value advertised to the
//! internal transport. The pool is the one piece of cross-connection
//! shared state in the crate, so it provides its own synchronisation;
//! the engine only holds per-connection creditor entries.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::transport::{BudgetId, TraceId};

/// Handle to one budget entry inside a creditor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CreditorIndex(u64);

impl std::fmt::Display for CreditorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CreditorIndex({})", self.0)
    }
}

/// Aggregates per-link credit into one shared budget value.
///
/// Implementations must be safe to call from multiple connections
/// concurrently.
pub trait BudgetCreditor: Send + Sync {
    /// Register a budget entry; called at reply-open time.
    fn acquire(&self, budget_id: BudgetId) -> CreditorIndex;

    /// Add `credit` bytes to the entry, returning the previous total.
    fn credit(&self, trace_id: TraceId, index: CreditorIndex, credit: u64) -> u64;

    /// Drop the entry; called at reply-close or cleanup. Idempotent.
    fn release(&self, index: CreditorIndex);
}

#[derive(Debug)]
struct Entry {
    budget_id: BudgetId,
    total: u64,
}

/// Default in-process creditor backed by a concurrent map.
#[derive(Debug, Default)]
pub struct SharedCreditor {
    entries: DashMap<u64, Entry>,
    next_index: AtomicU64,
}

impl SharedCreditor {
    /// Create an empty creditor.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Current total credited against `budget_id`, summed over entries.
    #[must_use]
    pub fn balance(&self, budget_id: BudgetId) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.budget_id == budget_id)
            .map(|entry| entry.total)
            .sum()
    }
}

impl BudgetCreditor for SharedCreditor {
    fn acquire(&self, budget_id: BudgetId) -> CreditorIndex {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            index,
            Entry {
                budget_id,
                total: 0,
            },
        );
        CreditorIndex(index)
    }

    fn credit(&self, trace_id: TraceId, index: CreditorIndex, credit: u64) -> u64 {
        let Some(mut entry) = self.entries.get_mut(&index.0) else {
            tracing::warn!(%trace_id, %index, "credit against released entry");
            return 0;
        };
        let previous = entry.total;
        entry.total += credit;
        previous
    }

    fn release(&self, index: CreditorIndex) { self.entries.remove(&index.0); }
}

#[cfg(test)]
mod tests {
    use super::{BudgetCreditor, SharedCreditor};
    use crate::transport::{BudgetId, TraceId};

    #[test]
    fn credit_accumulates_and_reports_previous_total() {
        let creditor = SharedCreditor::new();
        let index = creditor.acquire(BudgetId(9));

        assert_eq!(creditor.credit(TraceId(1), index, 100), 0);
        assert_eq!(creditor.credit(TraceId(2), index, 50), 100);
        assert_eq!(creditor.balance(BudgetId(9)), 150);
    }

    #[test]
    fn release_is_idempotent_and_clears_balance() {
        let creditor = SharedCreditor::new();
        let index = creditor.acquire(BudgetId(4));
        creditor.credit(TraceId(1), index, 10);

        creditor.release(index);
        creditor.release(index);
        assert_eq!(creditor.balance(BudgetId(4)), 0);
        assert_eq!(creditor.credit(TraceId(2), index, 10), 0);
    }
}
