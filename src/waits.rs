use crate::trx::Transaction;

use linked_hash_set::LinkedHashSet;
use serde::{Deserialize, Serialize};

/// Callback surface for an external cycle detector.
///
/// The manager records at most one outgoing wait-for edge per transaction and
/// reports every edge it publishes through this trait. Detection itself is
/// out of scope; a detector walks the reported edges (or pulls a full
/// snapshot via `LockManager::wait_graph`) and resolves cycles by calling
/// `rollback_victim`.
pub trait WaitObserver: Send + Sync {
    /// A waiter started, or re-pointed, its wait-for edge.
    fn on_edge(&self, _waiter: u64, _blocker: u64) {}

    /// A waiter's edge was cleared (grant, cancellation, or rollback).
    fn on_edge_cleared(&self, _waiter: u64) {}

    /// A deadlock was resolved. `cycle` is the wait-for cycle as the
    /// detector reported it, in edge order; `victim` is the member chosen
    /// to roll back.
    fn on_deadlock(&self, _cycle: &[u64], _victim: u64) {}
}

/// Observer that discards everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl WaitObserver for NoopObserver {}

/// One wait-for edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter: u64,
    pub blocker: u64,
}

/// Snapshot of all outgoing edges of registered transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitGraph {
    pub edges: Vec<WaitEdge>,
}

impl WaitGraph {
    pub fn blocker_of(&self, waiter: u64) -> Option<u64> {
        self.edges
            .iter()
            .find(|e| e.waiter == waiter)
            .map(|e| e.blocker)
    }
}

/// Pick the blocker a waiter should point its edge at.
///
/// `candidates` holds `(transaction id, grant stamp)` for every conflicting
/// lock ahead of the waiter. Blockers are considered newest-stamp-first so
/// the detector explores recent dependencies before old ones, and blockers
/// already reported for the current wait are skipped. When every candidate
/// has been reported the newest one is returned again rather than leaving
/// the waiter edgeless.
pub(crate) fn choose_blocker(waiter: &Transaction, candidates: &[(u64, u64)]) -> Option<u64> {
    let mut ordered: Vec<(u64, u64)> = candidates
        .iter()
        .filter(|(id, _)| *id != waiter.id())
        .copied()
        .collect();
    if ordered.is_empty() {
        return None;
    }
    ordered.sort_by(|a, b| b.1.cmp(&a.1));

    let mut notified = waiter.notified.lock();
    let pick = ordered
        .iter()
        .find(|(id, _)| !notified.contains(id))
        .or_else(|| ordered.first())
        .map(|(id, _)| *id);
    if let Some(id) = pick {
        notified.insert(id);
    }
    pick
}

/// Transactions a high-priority transaction has marked for forced rollback,
/// in the order they were hit.
#[derive(Debug, Default)]
pub struct HitList {
    inner: LinkedHashSet<u64>,
}

impl HitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64) -> bool {
        self.inner.insert(id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_blocker_test() {
        let waiter = Transaction::new(1, false, false);

        // newest stamp first
        assert_eq!(choose_blocker(&waiter, &[(2, 10), (3, 30), (4, 20)]), Some(3));

        // already-reported blockers are skipped
        assert_eq!(choose_blocker(&waiter, &[(2, 10), (3, 30), (4, 20)]), Some(4));
        assert_eq!(choose_blocker(&waiter, &[(2, 10), (3, 30), (4, 20)]), Some(2));

        // all reported: fall back to the newest
        assert_eq!(choose_blocker(&waiter, &[(2, 10), (3, 30), (4, 20)]), Some(3));

        // own locks are never blockers
        assert_eq!(choose_blocker(&waiter, &[(1, 99)]), None);
    }

    #[test]
    fn choose_blocker_reset_test() {
        let waiter = Transaction::new(1, false, false);
        assert_eq!(choose_blocker(&waiter, &[(2, 10), (3, 30)]), Some(3));

        // a grant or cancellation clears the reported set
        waiter.clear_edge();
        assert_eq!(choose_blocker(&waiter, &[(2, 10), (3, 30)]), Some(3));
    }

    #[test]
    fn hit_list_test() {
        let mut hits = HitList::new();
        assert!(hits.insert(5));
        assert!(hits.insert(2));
        assert!(!hits.insert(5)); // no duplicates
        assert!(hits.insert(9));

        // rollback order is hit order
        let order: Vec<u64> = hits.iter().copied().collect();
        assert_eq!(order, vec![5, 2, 9]);
        assert!(hits.contains(2));
        assert_eq!(hits.len(), 3);
    }
}
