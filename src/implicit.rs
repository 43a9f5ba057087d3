use crate::common::error::NonFatalError;
use crate::lock::mode::{LockMode, Precision};
use crate::lock::record::RecordLock;
use crate::lock::RecordId;
use crate::manager::LockManager;
use crate::trx::{OwnedLock, Transaction};

use std::sync::Arc;
use tracing::debug;

/// Version metadata the lock manager needs from the MVCC layer.
///
/// A row modified by an uncommitted transaction is implicitly locked without
/// any lock object existing. Before another transaction can wait on such a
/// row the implicit lock must be made explicit.
pub trait MvccView {
    /// Whether the transaction is still active (uncommitted).
    fn is_active(&self, trx: u64) -> bool;

    /// The transaction that last modified a record. For secondary-index rows
    /// the implementation resolves this through the clustered index.
    fn modifier_of(&self, index: u64, rec: RecordId) -> Option<u64>;
}

impl LockManager {
    /// Give the active modifier of a record an explicit exclusive lock on it.
    ///
    /// Idempotent: if an equivalent explicit lock already exists nothing is
    /// created. Returns the modifier's id when a conversion applied, `None`
    /// when the record carries no implicit lock.
    pub fn convert_implicit(
        &self,
        view: &dyn MvccView,
        index: u64,
        rec: RecordId,
    ) -> Result<Option<u64>, NonFatalError> {
        let modifier = match view.modifier_of(index, rec) {
            Some(modifier) => modifier,
            None => return Ok(None),
        };
        if !view.is_active(modifier) {
            return Ok(None);
        }
        let owner = match self.trx_handle(modifier) {
            Some(owner) => owner,
            None => return Ok(None),
        };

        // the pin keeps the owner's commit cleanup from tearing its lock
        // list down mid-conversion; once release has begun the row is no
        // longer implicitly locked and nothing may be installed
        if !owner.try_pin() {
            return Ok(None);
        }
        let converted = self.convert_pinned(&owner, index, rec);
        owner.unpin();

        converted.map(|_| Some(modifier))
    }

    fn convert_pinned(
        &self,
        owner: &Arc<Transaction>,
        index: u64,
        rec: RecordId,
    ) -> Result<(), NonFatalError> {
        let _g = self.global_latch().read();
        let shard = self.shards().shard_of(rec.page);
        let mut state = self.shards().shard(shard).lock();

        for &r in &state.queue_refs(rec.page) {
            if let Some(l) = state.lock(r) {
                if l.trx() == owner.id()
                    && !l.is_waiting()
                    && l.mode() == LockMode::Exclusive
                    && l.precision().covers_record()
                    && l.covers(rec.heap_no)
                {
                    return Ok(()); // already explicit
                }
            }
        }

        self.try_claim_slot()?;
        let lock = RecordLock::new(
            owner.id(),
            index,
            rec.page,
            LockMode::Exclusive,
            Precision::RecNotGap,
            false,
            owner.is_high_priority(),
            rec.heap_no,
            self.next_stamp(),
        );
        let r = state.push_lock(lock);
        state.move_to_front(rec.page, r);

        let mut tl = owner.locks.lock();
        tl.owned.push(OwnedLock::Record {
            shard,
            page: rec.page,
            lock: r,
        });
        tl.bump();
        drop(tl);

        self.stats().inc_implicit_conversions();
        debug!(
            "implicit lock of {} on {}:{} made explicit",
            owner.id(),
            rec.page,
            rec.heap_no
        );
        Ok(())
    }
}
