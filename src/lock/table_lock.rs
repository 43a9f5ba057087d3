use crate::lock::mode::TableMode;

/// Represents a table lock: one table-wide mode held or requested by a transaction.
#[derive(Debug, Clone)]
pub struct TableLock {
    pub(crate) trx: u64,

    pub(crate) table: u64,

    pub(crate) mode: TableMode,

    pub(crate) waiting: bool,

    pub(crate) high_priority: bool,

    pub(crate) stamp: u64,

    pub(crate) weight: u64,
}

impl TableLock {
    pub(crate) fn new(
        trx: u64,
        table: u64,
        mode: TableMode,
        waiting: bool,
        high_priority: bool,
        stamp: u64,
    ) -> Self {
        Self {
            trx,
            table,
            mode,
            waiting,
            high_priority,
            stamp,
            weight: 0,
        }
    }

    pub fn trx(&self) -> u64 {
        self.trx
    }

    pub fn mode(&self) -> TableMode {
        self.mode
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }
}
