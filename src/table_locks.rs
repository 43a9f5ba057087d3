use crate::common::latch::Latch;
use crate::lock::mode::TableMode;
use crate::lock::table_lock::TableLock;

use dashmap::DashMap;
use std::sync::Arc;
use strum::IntoEnumIterator;

/// Per-table lock lists, each behind its own latch.
#[derive(Debug)]
pub struct TableLocks {
    map: DashMap<u64, Arc<Latch<TableQueue>>>,
    spin_rounds: usize,
}

/// One table's lock list plus per-mode counters.
///
/// Counters cover granted and waiting entries; they exist so intention
/// requests can skip the scan when no shared/exclusive lock is present, and
/// so the zero-reference transition can be cross-checked against the list.
#[derive(Debug)]
pub struct TableQueue {
    pub(crate) list: Vec<TableLock>,
    counts: [u32; 5],
}

impl TableLocks {
    pub fn new(spin_rounds: usize) -> Self {
        Self {
            map: DashMap::new(),
            spin_rounds,
        }
    }

    /// Latch handle for a table, creating its list on first use.
    pub fn table(&self, table_id: u64) -> Arc<Latch<TableQueue>> {
        if let Some(entry) = self.map.get(&table_id) {
            return Arc::clone(&entry);
        }

        // double check nobody beat me to it
        let entry = self
            .map
            .entry(table_id)
            .or_insert_with(|| {
                Arc::new(Latch::with_spin_rounds(TableQueue::new(), self.spin_rounds))
            });
        Arc::clone(&entry)
    }

    /// Drop a table's lock state entirely (table drop under the global latch).
    pub fn drop_table(&self, table_id: u64) -> Option<Arc<Latch<TableQueue>>> {
        self.map.remove(&table_id).map(|(_, v)| v)
    }

    pub fn table_ids(&self) -> Vec<u64> {
        self.map.iter().map(|e| *e.key()).collect()
    }
}

impl TableQueue {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            counts: [0; 5],
        }
    }

    pub(crate) fn push(&mut self, entry: TableLock) {
        self.counts[entry.mode.index()] += 1;
        self.list.push(entry);
    }

    pub(crate) fn remove_at(&mut self, pos: usize) -> TableLock {
        let entry = self.list.remove(pos);
        self.counts[entry.mode.index()] -= 1;
        entry
    }

    /// Zero shared/exclusive entries: intention requests cannot conflict.
    pub(crate) fn no_shared_exclusive(&self) -> bool {
        self.counts[TableMode::Shared.index()] == 0
            && self.counts[TableMode::Exclusive.index()] == 0
    }

    pub fn reference_count(&self) -> usize {
        self.list.len()
    }

    pub fn mode_count(&self, mode: TableMode) -> u32 {
        self.counts[mode.index()]
    }

    /// The list and the per-mode counters must agree.
    pub(crate) fn counters_agree(&self) -> bool {
        TableMode::iter().all(|mode| {
            self.list.iter().filter(|l| l.mode == mode).count() as u32 == self.counts[mode.index()]
        })
    }
}
