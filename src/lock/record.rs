use crate::lock::bitmap::Bitmap;
use crate::lock::mode::{LockMode, Precision};
use crate::lock::PageId;

/// Represents a record lock object: grants or a wait for row positions on one page.
///
/// A single object carries a bitmap of heap positions, so one allocation holds
/// grants for many rows on the page by the same transaction under the same
/// mode and precision. Bits are added and removed independently; the grouping
/// is a memory-density optimization, not a semantic one.
#[derive(Debug, Clone)]
pub struct RecordLock {
    /// Owning transaction.
    pub(crate) trx: u64,

    /// Index the locked rows belong to.
    pub(crate) index: u64,

    /// Page the bitmap addresses.
    pub(crate) page: PageId,

    pub(crate) mode: LockMode,

    pub(crate) precision: Precision,

    /// Pending request rather than a grant.
    pub(crate) waiting: bool,

    /// Owner is a high-priority transaction.
    pub(crate) high_priority: bool,

    /// Heap positions held or (for a wait) the single requested position.
    pub(crate) bitmap: Bitmap,

    /// Monotonic arrival stamp; used for reverse-chronological wait-for edge
    /// selection and FIFO ordering within a priority class.
    pub(crate) stamp: u64,

    /// Bumped each time the grant scheduler passes this waiter over.
    pub(crate) weight: u64,
}

impl RecordLock {
    pub(crate) fn new(
        trx: u64,
        index: u64,
        page: PageId,
        mode: LockMode,
        precision: Precision,
        waiting: bool,
        high_priority: bool,
        heap_no: u32,
        stamp: u64,
    ) -> Self {
        Self {
            trx,
            index,
            page,
            mode,
            precision,
            waiting,
            high_priority,
            bitmap: Bitmap::single(heap_no),
            stamp,
            weight: 0,
        }
    }

    pub fn trx(&self) -> u64 {
        self.trx
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn covers(&self, heap_no: u32) -> bool {
        self.bitmap.contains(heap_no)
    }

    /// The heap position a waiting lock is queued on.
    pub fn wait_heap_no(&self) -> Option<u32> {
        if self.waiting {
            self.bitmap.single_bit()
        } else {
            None
        }
    }
}
