use serde::{Deserialize, Serialize};
use std::fmt;

pub mod mode;

pub mod bitmap;

pub mod record;

pub mod table_lock;

pub mod arena;

/// Heap position of the low page bound (infimum) sentinel.
pub const HEAP_NO_INFIMUM: u32 = 0;

/// Heap position of the high page bound (supremum) sentinel.
pub const HEAP_NO_SUPREMUM: u32 = 1;

/// First heap position assignable to a user record.
pub const HEAP_NO_USER_LOW: u32 = 2;

/// Identifies a page: tablespace id plus page number.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone, Copy, PartialOrd, Ord)]
pub struct PageId {
    pub space: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(space: u32, page_no: u32) -> Self {
        Self { space, page_no }
    }
}

/// Identifies a record by page identity and heap position.
///
/// Heap positions are stable per-page slot numbers, independent of physical
/// byte offset; positions 0 and 1 are the infimum/supremum sentinels.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct RecordId {
    pub page: PageId,
    pub heap_no: u32,
}

impl RecordId {
    pub fn new(page: PageId, heap_no: u32) -> Self {
        Self { page, heap_no }
    }

    pub fn is_supremum(&self) -> bool {
        self.heap_no == HEAP_NO_SUPREMUM
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.space, self.page_no)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{},{})", self.page.space, self.page.page_no, self.heap_no)
    }
}
