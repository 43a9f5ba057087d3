use crate::lock::arena::LockRef;
use crate::lock::mode::TableMode;
use crate::lock::PageId;

use arrayvec::ArrayVec;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Owned-lock entries kept inline before spilling.
const INLINE_LOCKS: usize = 32;

/// Sentinel for "not blocked on anyone".
pub(crate) const NO_BLOCKER: u64 = 0;

/// How a suspended thread was woken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitStatus {
    /// The wait turned into a grant.
    Granted,

    /// Chosen as deadlock victim or force-rolled-back by a high-priority
    /// transaction.
    Deadlock,

    /// Wait cancelled: kill, or the waited-on row was removed.
    Cancelled,

    /// Caller-supplied timeout elapsed.
    Timeout,
}

/// Per-transaction wait slot.
///
/// A thread that must wait for a grant parks here rather than busy-spinning;
/// it is resumed only by the grant scheduler or a cancellation path, with a
/// status distinguishing a grant from a cancellation.
#[derive(Debug)]
pub struct WaitSlot {
    state: Mutex<Option<WaitStatus>>,
    cvar: Condvar,
}

impl WaitSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cvar: Condvar::new(),
        }
    }

    /// Arm the slot before enqueueing a wait.
    pub(crate) fn arm(&self) {
        *self.state.lock() = None;
    }

    pub(crate) fn wake(&self, status: WaitStatus) {
        let mut state = self.state.lock();
        // first status wins; a grant racing a cancellation must not be masked
        if state.is_none() {
            *state = Some(status);
        }
        self.cvar.notify_all();
    }

    pub(crate) fn wait(&self) -> WaitStatus {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cvar.wait(&mut state);
        }
        state.unwrap()
    }

    /// Wait with a timeout; `None` means the slot was never woken.
    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<WaitStatus> {
        let mut state = self.state.lock();
        if state.is_none() {
            self.cvar.wait_for(&mut state, timeout);
        }
        *state
    }

    /// Peek without blocking.
    pub(crate) fn status(&self) -> Option<WaitStatus> {
        *self.state.lock()
    }
}

/// Identifies a lock owned by a transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OwnedLock {
    Record {
        shard: usize,
        page: PageId,
        lock: LockRef,
    },
    Table {
        table: u64,
        mode: TableMode,
    },
}

/// Ordered list of a transaction's lock objects.
///
/// The first entries live inline; long transactions spill to the heap. The
/// inline portion plus `clear` keeping capacity acts as the pre-allocated
/// pool reused across statements.
#[derive(Debug)]
pub struct OwnedList {
    inline: ArrayVec<OwnedLock, INLINE_LOCKS>,
    spill: Vec<OwnedLock>,
}

impl OwnedList {
    fn new() -> Self {
        Self {
            inline: ArrayVec::new(),
            spill: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: OwnedLock) {
        if self.inline.try_push(entry).is_err() {
            self.spill.push(entry);
        }
    }

    pub fn last(&self) -> Option<OwnedLock> {
        self.spill.last().or_else(|| self.inline.last()).copied()
    }

    pub fn pop(&mut self) -> Option<OwnedLock> {
        self.spill.pop().or_else(|| self.inline.pop())
    }

    /// Remove one matching entry, preserving order of the rest.
    pub fn remove(&mut self, entry: OwnedLock) -> bool {
        if let Some(pos) = self.spill.iter().position(|e| *e == entry) {
            self.spill.remove(pos);
            return true;
        }
        if let Some(pos) = self.inline.iter().position(|e| *e == entry) {
            self.inline.remove(pos);
            return true;
        }
        false
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &OwnedLock> {
        self.inline.iter().chain(self.spill.iter())
    }

    pub fn len(&self) -> usize {
        self.inline.len() + self.spill.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inline.is_empty() && self.spill.is_empty()
    }

    pub fn clear(&mut self) {
        self.inline.clear();
        self.spill.clear(); // keeps capacity for the next statement
    }
}

/// Lock state owned by one transaction, guarded by the transaction's own lock.
#[derive(Debug)]
pub struct TrxLocks {
    /// Bumped on every insertion/removal; readers that dropped this latch to
    /// obtain a shard latch re-validate against it.
    pub(crate) version: u64,

    /// Ordered list of owned lock objects.
    pub(crate) owned: OwnedList,

    /// The at-most-one outstanding wait.
    pub(crate) waiting: Option<OwnedLock>,

    /// Release or forced rollback has begun; no further pins may be taken.
    pub(crate) released: bool,
}

impl TrxLocks {
    fn new() -> Self {
        Self {
            version: 0,
            owned: OwnedList::new(),
            waiting: None,
            released: false,
        }
    }

    pub(crate) fn bump(&mut self) {
        self.version += 1;
    }
}

/// Represents a transaction registered with the lock manager.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: u64,

    pub(crate) high_priority: bool,

    pub(crate) read_only: bool,

    /// Set by a high-priority transaction forcing this one to roll back.
    pub(crate) rollback_forced: AtomicBool,

    /// Pins taken by implicit-lock conversion; commit cleanup drains these
    /// before tearing the lock list down.
    pins: AtomicU32,

    pub(crate) locks: Mutex<TrxLocks>,

    pub(crate) slot: WaitSlot,

    /// Current best-known blocking transaction (wait-for edge); `NO_BLOCKER`
    /// when not waiting.
    blocking: AtomicU64,

    /// Blockers already reported to the cycle detector for the current wait.
    pub(crate) notified: Mutex<FxHashSet<u64>>,
}

impl Transaction {
    pub(crate) fn new(id: u64, high_priority: bool, read_only: bool) -> Self {
        Self {
            id,
            high_priority,
            read_only,
            rollback_forced: AtomicBool::new(false),
            pins: AtomicU32::new(0),
            locks: Mutex::new(TrxLocks::new()),
            slot: WaitSlot::new(),
            blocking: AtomicU64::new(NO_BLOCKER),
            notified: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_rollback_forced(&self) -> bool {
        self.rollback_forced.load(Ordering::Acquire)
    }

    /// The transaction this one believes is blocking it.
    pub fn wait_for_edge(&self) -> Option<u64> {
        match self.blocking.load(Ordering::Acquire) {
            NO_BLOCKER => None,
            blocker => Some(blocker),
        }
    }

    pub(crate) fn set_edge(&self, blocker: u64) {
        self.blocking.store(blocker, Ordering::Release);
    }

    pub(crate) fn clear_edge(&self) {
        self.blocking.store(NO_BLOCKER, Ordering::Release);
        self.notified.lock().clear();
    }

    /// Take a conversion pin, unless release has already begun.
    ///
    /// The increment happens under the lock-list latch, so it is ordered
    /// against the release path setting `released` under the same latch: a
    /// successful pin is visible to the subsequent `drain_pins`, and a pin
    /// attempted after the flag is set fails.
    pub(crate) fn try_pin(&self) -> bool {
        let tl = self.locks.lock();
        if tl.released {
            return false;
        }
        self.pins.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    /// Spin until conversions in flight have released their pins.
    pub(crate) fn drain_pins(&self) {
        while self.pins.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }
}
