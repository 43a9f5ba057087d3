use crate::common::latch::Latch;
use crate::lock::arena::{LockArena, LockRef};
use crate::lock::record::RecordLock;
use crate::lock::PageId;

use crossbeam_utils::CachePadded;
use rustc_hash::FxHashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Sharded record-lock queue storage.
///
/// Queues are partitioned by page identity; each shard carries its own latch
/// and its own lock arena, so unrelated pages can be locked concurrently.
#[derive(Debug)]
pub struct RecordShards {
    shards: Vec<CachePadded<Latch<ShardState>>>,
    mask: usize,
}

/// One shard's state: its arena of lock objects and its page-to-queue map.
#[derive(Debug)]
pub struct ShardState {
    pub(crate) arena: LockArena,
    queues: FxHashMap<PageId, Vec<LockRef>>,
}

impl RecordShards {
    /// Create `shards` partitions, rounded up to a power of two.
    pub fn new(shards: usize, spin_rounds: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        let mut vec = Vec::with_capacity(count);

        for _ in 0..count {
            vec.push(CachePadded::new(Latch::with_spin_rounds(
                ShardState::new(),
                spin_rounds,
            )));
        }

        Self {
            shards: vec,
            mask: count - 1,
        }
    }

    pub fn shard_of(&self, page: PageId) -> usize {
        let mut s = DefaultHasher::new();
        page.hash(&mut s);
        (s.finish() as usize) & self.mask
    }

    pub fn shard(&self, idx: usize) -> &Latch<ShardState> {
        &self.shards[idx]
    }

    pub fn count(&self) -> usize {
        self.shards.len()
    }
}

impl ShardState {
    fn new() -> Self {
        Self {
            arena: LockArena::new(),
            queues: FxHashMap::default(),
        }
    }

    /// Queue of lock refs for a page; empty slice if the page has no locks.
    pub fn queue(&self, page: PageId) -> &[LockRef] {
        self.queues.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn queue_refs(&self, page: PageId) -> Vec<LockRef> {
        self.queue(page).to_vec()
    }

    pub fn lock(&self, r: LockRef) -> Option<&RecordLock> {
        self.arena.get(r)
    }

    pub fn lock_mut(&mut self, r: LockRef) -> Option<&mut RecordLock> {
        self.arena.get_mut(r)
    }

    /// Allocate a lock object and append it to its page's queue.
    pub fn push_lock(&mut self, lock: RecordLock) -> LockRef {
        let page = lock.page;
        let r = self.arena.insert(lock);
        self.queues.entry(page).or_insert_with(Vec::new).push(r);
        r
    }

    /// Remove a lock object from its queue and free it.
    pub fn remove_lock(&mut self, page: PageId, r: LockRef) -> Option<RecordLock> {
        let removed = self.arena.remove(r)?;

        if let Some(queue) = self.queues.get_mut(&page) {
            if let Some(pos) = queue.iter().position(|x| *x == r) {
                queue.remove(pos);
            }
            if queue.is_empty() {
                self.queues.remove(&page);
            }
        }

        Some(removed)
    }

    /// Move a freshly granted lock to the front of the queue, ahead of the
    /// remaining waiters.
    pub fn move_to_front(&mut self, page: PageId, r: LockRef) {
        if let Some(queue) = self.queues.get_mut(&page) {
            if let Some(pos) = queue.iter().position(|x| *x == r) {
                let lock_ref = queue.remove(pos);
                queue.insert(0, lock_ref);
            }
        }
    }

    /// Replace a page's queue order wholesale (page reorganization).
    pub(crate) fn replace_queue(&mut self, page: PageId, refs: Vec<LockRef>) {
        if refs.is_empty() {
            self.queues.remove(&page);
        } else {
            self.queues.insert(page, refs);
        }
    }

    /// Pages that currently have lock queues in this shard.
    pub fn pages(&self) -> Vec<PageId> {
        self.queues.keys().copied().collect()
    }

    pub fn live_locks(&self) -> usize {
        self.arena.len()
    }
}
