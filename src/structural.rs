//! Lock propagation across page structure changes. The storage layer calls
//! these while it holds the affected pages exclusively, so the operations
//! never fail; they reshape lock state to keep gap coverage equivalent.

use crate::common::latch::LatchGuard;
use crate::lock::arena::LockRef;
use crate::lock::bitmap::Bitmap;
use crate::lock::mode::Precision;
use crate::lock::record::RecordLock;
use crate::lock::{PageId, RecordId, HEAP_NO_INFIMUM, HEAP_NO_SUPREMUM};
use crate::manager::LockManager;
use crate::queue::ShardState;
use crate::trx::{OwnedLock, WaitStatus};

use tracing::debug;

/// Latches for one or two pages' shards, taken in ascending shard order.
enum PagePair<'a> {
    Same(LatchGuard<'a, ShardState>),
    Split {
        low: LatchGuard<'a, ShardState>,
        low_idx: usize,
        high: LatchGuard<'a, ShardState>,
    },
}

impl<'a> PagePair<'a> {
    fn state(&mut self, shard: usize) -> &mut ShardState {
        match self {
            PagePair::Same(guard) => &mut *guard,
            PagePair::Split { low, low_idx, high } => {
                if shard == *low_idx {
                    &mut *low
                } else {
                    &mut *high
                }
            }
        }
    }
}

impl LockManager {
    fn lock_pages(&self, a: PageId, b: PageId) -> (PagePair<'_>, usize, usize) {
        let sa = self.shards().shard_of(a);
        let sb = self.shards().shard_of(b);
        let pair = if sa == sb {
            PagePair::Same(self.shards().shard(sa).lock())
        } else {
            let (lo, hi) = if sa < sb { (sa, sb) } else { (sb, sa) };
            let low = self.shards().shard(lo).lock();
            let high = self.shards().shard(hi).lock();
            PagePair::Split {
                low,
                low_idx: lo,
                high,
            }
        };
        (pair, sa, sb)
    }

    /// The right sibling took the upper half of a page's records. Locks on the
    /// old supremum follow the records to the new page's supremum, and the
    /// right page's first record donates its locks to the left supremum as gap
    /// locks so both boundary gaps stay covered.
    pub fn on_split_right(&self, left: PageId, right: PageId, right_first_heap: u32) {
        debug!("split right: {} -> {}, first heap {}", left, right, right_first_heap);
        let _g = self.global_latch().read();
        let (mut pair, sl, sr) = self.lock_pages(left, right);

        self.move_position(
            &mut pair,
            sl,
            RecordId::new(left, HEAP_NO_SUPREMUM),
            sr,
            RecordId::new(right, HEAP_NO_SUPREMUM),
        );

        let sources = granted_covering(pair.state(sr), right, right_first_heap);
        for src in &sources {
            if src.precision() == Precision::InsertIntention {
                continue;
            }
            self.inherit_lock(&mut pair, sl, src, RecordId::new(left, HEAP_NO_SUPREMUM));
        }

        self.rescan_record_grants(pair.state(sl), left);
        self.rescan_record_grants(pair.state(sr), right);
    }

    /// A page's records were merged into a sibling; `heir_heap` is the
    /// receiver-side record that now bounds the donor's old key range. Donor
    /// supremum locks are inherited to the heir's gap, then the donor's
    /// remaining lock state is torn down (waiters re-resolve after waking).
    pub fn on_merge(&self, donor: PageId, receiver: PageId, heir_heap: u32) {
        debug!("merge: {} into {}, heir heap {}", donor, receiver, heir_heap);
        let _g = self.global_latch().read();
        let (mut pair, sd, sr) = self.lock_pages(donor, receiver);

        let sources = granted_covering(pair.state(sd), donor, HEAP_NO_SUPREMUM);
        for src in &sources {
            if src.precision() == Precision::InsertIntention {
                continue;
            }
            self.inherit_lock(&mut pair, sr, src, RecordId::new(receiver, heir_heap));
        }

        // tear down everything left on the donor page
        for r in pair.state(sd).queue_refs(donor) {
            let waiting = match pair.state(sd).lock(r) {
                Some(l) => l.is_waiting(),
                None => continue,
            };
            if waiting {
                self.cancel_queued_wait(pair.state(sd), donor, r);
            } else {
                self.drop_granted(pair.state(sd), sd, donor, r);
            }
        }

        self.rescan_record_grants(pair.state(sr), receiver);
    }

    /// Relocate lock bits across pages for records that physically moved,
    /// given the old-to-new heap mapping.
    pub fn move_record_locks(&self, from: PageId, to: PageId, map: &[(u32, u32)]) {
        // same-page remapping is a reorganize
        debug_assert!(from != to);
        debug!("move {} lock positions: {} -> {}", map.len(), from, to);
        let _g = self.global_latch().read();
        let (mut pair, sf, st) = self.lock_pages(from, to);

        for &(old, new) in map {
            self.move_position(
                &mut pair,
                sf,
                RecordId::new(from, old),
                st,
                RecordId::new(to, new),
            );
        }

        self.rescan_record_grants(pair.state(sf), from);
        self.rescan_record_grants(pair.state(st), to);
    }

    /// A page was compacted in place; every user record may have a new heap
    /// position. Bitmaps are remapped wholesale, waiters whose position
    /// vanished are cancelled, and the queue is rebuilt grants-first.
    pub fn on_reorganize(&self, page: PageId, map: &[(u32, u32)]) {
        debug!("reorganize {}: {} positions", page, map.len());
        let _g = self.global_latch().read();
        let shard = self.shards().shard_of(page);
        let mut state = self.shards().shard(shard).lock();

        let refs = state.queue_refs(page);
        let mut grants: Vec<LockRef> = Vec::new();
        let mut waits: Vec<LockRef> = Vec::new();
        let mut cancelled: Vec<LockRef> = Vec::new();
        let mut emptied: Vec<LockRef> = Vec::new();

        for &r in &refs {
            let lock = match state.lock_mut(r) {
                Some(lock) => lock,
                None => continue,
            };
            if lock.waiting {
                let moved = lock
                    .wait_heap_no()
                    .and_then(|h| remap(map, h));
                match moved {
                    Some(new) => {
                        lock.bitmap = Bitmap::single(new);
                        waits.push(r);
                    }
                    None => cancelled.push(r),
                }
            } else {
                let old = lock.bitmap.take();
                for &(o, n) in map {
                    if old.contains(o) {
                        lock.bitmap.set(n);
                    }
                }
                // sentinels never move
                if old.contains(HEAP_NO_INFIMUM) {
                    lock.bitmap.set(HEAP_NO_INFIMUM);
                }
                if old.contains(HEAP_NO_SUPREMUM) {
                    lock.bitmap.set(HEAP_NO_SUPREMUM);
                }
                if lock.bitmap.is_empty() {
                    emptied.push(r);
                } else {
                    grants.push(r);
                }
            }
        }

        for r in cancelled {
            self.cancel_queued_wait(&mut state, page, r);
        }
        for r in emptied {
            self.drop_granted(&mut state, shard, page, r);
        }

        grants.extend(waits);
        state.replace_queue(page, grants);
        self.rescan_record_grants(&mut state, page);
    }

    /// A record was purged; `heir` is its successor. The record's locks are
    /// inherited to the heir's gap (insert intentions die with the record),
    /// its bits are cleared, and its waiters are woken `Cancelled` so they
    /// re-resolve against the new page layout.
    pub fn on_delete(&self, rec: RecordId, heir: RecordId) {
        debug!("delete {}:{}, heir {}:{}", rec.page, rec.heap_no, heir.page, heir.heap_no);
        let _g = self.global_latch().read();
        let (mut pair, sr, sh) = self.lock_pages(rec.page, heir.page);

        let sources = granted_covering(pair.state(sr), rec.page, rec.heap_no);
        for src in &sources {
            if src.precision() == Precision::InsertIntention {
                continue;
            }
            self.inherit_lock(&mut pair, sh, src, heir);
        }

        for r in pair.state(sr).queue_refs(rec.page) {
            let covers = match pair.state(sr).lock(r) {
                Some(l) if l.covers(rec.heap_no) => Some(l.is_waiting()),
                _ => None,
            };
            match covers {
                Some(true) => self.cancel_queued_wait(pair.state(sr), rec.page, r),
                Some(false) => {
                    let empty = {
                        let state = pair.state(sr);
                        match state.lock_mut(r) {
                            Some(l) => {
                                l.bitmap.clear(rec.heap_no);
                                l.bitmap.is_empty()
                            }
                            None => false,
                        }
                    };
                    if empty {
                        self.drop_granted(pair.state(sr), sr, rec.page, r);
                    }
                }
                None => {}
            }
        }

        self.rescan_record_grants(pair.state(sr), rec.page);
        if heir.page != rec.page {
            self.rescan_record_grants(pair.state(sh), heir.page);
        }
    }

    /// A record was inserted; the gap it split inherits coverage from its
    /// successor. Only locks that cover a gap propagate; rec-not-gap and
    /// insert-intention locks do not. Nobody is woken.
    pub fn on_insert(&self, new_rec: RecordId, successor: RecordId) {
        debug!(
            "insert {}:{}, successor {}:{}",
            new_rec.page, new_rec.heap_no, successor.page, successor.heap_no
        );
        let _g = self.global_latch().read();
        let (mut pair, sn, ss) = self.lock_pages(new_rec.page, successor.page);

        let sources = granted_covering(pair.state(ss), successor.page, successor.heap_no);
        for src in &sources {
            if src.precision() == Precision::InsertIntention || !src.precision().covers_gap() {
                continue;
            }
            self.inherit_lock(&mut pair, sn, src, new_rec);
        }
    }

    /// Move every lock covering one heap position to another, possibly on a
    /// different page. Waiting objects are relocated wholesale (their owners'
    /// wait refs updated); granted bits are cleared and re-granted.
    fn move_position(
        &self,
        pair: &mut PagePair<'_>,
        from_shard: usize,
        from: RecordId,
        to_shard: usize,
        to: RecordId,
    ) {
        for r in pair.state(from_shard).queue_refs(from.page) {
            let snapshot = match pair.state(from_shard).lock(r) {
                Some(l) if l.covers(from.heap_no) => l.clone(),
                _ => continue,
            };

            if snapshot.is_waiting() {
                let mut removed = match pair.state(from_shard).remove_lock(from.page, r) {
                    Some(removed) => removed,
                    None => continue,
                };
                removed.page = to.page;
                removed.bitmap = Bitmap::single(to.heap_no);
                let nr = pair.state(to_shard).push_lock(removed);
                if let Some(owner) = self.trx_handle(snapshot.trx()) {
                    let mut tl = owner.locks.lock();
                    tl.waiting = Some(OwnedLock::Record {
                        shard: to_shard,
                        page: to.page,
                        lock: nr,
                    });
                    tl.bump();
                }
            } else {
                let empty = {
                    let state = pair.state(from_shard);
                    match state.lock_mut(r) {
                        Some(l) => {
                            l.bitmap.clear(from.heap_no);
                            l.bitmap.is_empty()
                        }
                        None => continue,
                    }
                };
                self.place_grant(pair.state(to_shard), to_shard, &snapshot, to, snapshot.precision());
                if empty {
                    self.drop_granted(pair.state(from_shard), from_shard, from.page, r);
                }
            }
        }
    }

    /// Inherit one granted lock to a destination position as a gap lock.
    fn inherit_lock(
        &self,
        pair: &mut PagePair<'_>,
        dest_shard: usize,
        src: &RecordLock,
        to: RecordId,
    ) {
        self.place_grant(pair.state(dest_shard), dest_shard, src, to, Precision::Gap);
        self.stats().inc_inherited();
    }

    /// Grant `src`'s mode at `to`, merging into an existing object when one
    /// of the same shape exists.
    fn place_grant(
        &self,
        state: &mut ShardState,
        shard: usize,
        src: &RecordLock,
        to: RecordId,
        precision: Precision,
    ) {
        let owner = match self.trx_handle(src.trx()) {
            Some(owner) => owner,
            None => return,
        };

        for &r in &state.queue_refs(to.page) {
            let fits = match state.lock(r) {
                Some(l) => {
                    l.trx == src.trx()
                        && !l.waiting
                        && l.mode == src.mode()
                        && l.precision == precision
                        && l.index == src.index
                }
                None => false,
            };
            if fits {
                if let Some(l) = state.lock_mut(r) {
                    l.bitmap.set(to.heap_no);
                }
                return;
            }
        }

        self.claim_slot_unchecked();
        let lock = RecordLock::new(
            src.trx(),
            src.index,
            to.page,
            src.mode(),
            precision,
            false,
            src.high_priority,
            to.heap_no,
            self.next_stamp(),
        );
        let r = state.push_lock(lock);
        state.move_to_front(to.page, r);

        let mut tl = owner.locks.lock();
        tl.owned.push(OwnedLock::Record {
            shard,
            page: to.page,
            lock: r,
        });
        tl.bump();
    }

    /// Remove a waiting lock object and wake its owner `Cancelled`.
    fn cancel_queued_wait(&self, state: &mut ShardState, page: PageId, r: LockRef) {
        if let Some(removed) = state.remove_lock(page, r) {
            self.release_slot();
            if let Some(owner) = self.trx_handle(removed.trx()) {
                let mut tl = owner.locks.lock();
                tl.waiting = None;
                tl.bump();
                drop(tl);
                owner.clear_edge();
                self.observer().on_edge_cleared(removed.trx());
                owner.slot.wake(WaitStatus::Cancelled);
                self.stats().inc_cancels();
            }
        }
    }

    /// Remove a granted lock object and detach it from its owner's list.
    fn drop_granted(&self, state: &mut ShardState, shard: usize, page: PageId, r: LockRef) {
        if let Some(removed) = state.remove_lock(page, r) {
            self.release_slot();
            if let Some(owner) = self.trx_handle(removed.trx()) {
                let mut tl = owner.locks.lock();
                tl.owned.remove(OwnedLock::Record { shard, page, lock: r });
                tl.bump();
            }
        }
    }
}

fn remap(map: &[(u32, u32)], heap_no: u32) -> Option<u32> {
    map.iter().find(|(old, _)| *old == heap_no).map(|&(_, new)| new)
}

/// Clone the granted locks whose bitmap covers a position.
fn granted_covering(state: &ShardState, page: PageId, heap_no: u32) -> Vec<RecordLock> {
    state
        .queue_refs(page)
        .iter()
        .filter_map(|&r| state.lock(r))
        .filter(|l| !l.is_waiting() && l.covers(heap_no))
        .cloned()
        .collect()
}
