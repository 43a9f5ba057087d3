//! Pure conflict rules: no state, consumed by the acquisition engine, the
//! grant scheduler, and validation.

use crate::lock::mode::{LockMode, Precision, TableMode};
use crate::lock::record::RecordLock;
use crate::lock::HEAP_NO_SUPREMUM;

/// Outcome of evaluating a request against one existing lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    NoConflict,
    Conflict,
    /// Requester may step over this waiting lock (see `record_conflict`).
    Bypass,
}

/// Table-mode compatibility over {IS, IX, S, X, AUTO_INC}.
///
/// Two locks from different transactions conflict unless compatible.
const TABLE_COMPAT: [[bool; 5]; 5] = [
    // IS     IX     S      X      AI
    [true, true, true, false, true],   // IS
    [true, true, false, false, true],  // IX
    [true, false, true, false, false], // S
    [false, false, false, false, false], // X
    [true, true, false, false, false], // AI
];

pub fn table_modes_compatible(a: TableMode, b: TableMode) -> bool {
    TABLE_COMPAT[a.index()][b.index()]
}

/// A record lock request under conflict evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RecordRequest {
    pub trx: u64,
    pub mode: LockMode,
    pub precision: Precision,
    pub heap_no: u32,
    pub high_priority: bool,
    /// Requester already holds a granted shared (or stronger) record-only
    /// lock on this row; enables the waiting-exclusive bypass rule.
    pub holds_record_share: bool,
}

impl RecordRequest {
    fn is_gap_only(&self) -> bool {
        self.heap_no == HEAP_NO_SUPREMUM || self.precision.is_gap_only()
    }
}

/// Evaluate a request against one existing lock covering the same heap position.
///
/// The caller is responsible for only passing locks whose bitmap covers the
/// requested position. Decision order:
///
/// 1. same transaction, or compatible modes;
/// 2. a high-priority requester ignores waiting low-priority locks;
/// 3. a gap-only non-insert-intention request never blocks on anything;
/// 4. a non-insert-intention request passes gap-only locks;
/// 5. an explicit gap request passes record-only locks;
/// 6. insert-intention locks block nobody;
/// 7. an exclusive request over a *waiting* exclusive lock may bypass it when
///    the requester already holds the row shared (prevents an insert
///    deadlocking against its own earlier shared probe);
/// 8. otherwise the requester must wait.
pub fn record_conflict(req: &RecordRequest, held: &RecordLock) -> Decision {
    // 1. own lock or compatible modes
    if held.trx == req.trx || req.mode.is_compatible(held.mode) {
        return Decision::NoConflict;
    }

    // 2. high-priority requests ignore waiting ordinary requests
    if req.high_priority && held.waiting && !held.high_priority {
        return Decision::NoConflict;
    }

    // 3. gap-only requests (supremum, or explicit gap) block on nothing
    if req.is_gap_only() && req.precision != Precision::InsertIntention {
        return Decision::NoConflict;
    }

    // 4. only insert intentions collide with gap-only locks
    if req.precision != Precision::InsertIntention && held.precision.is_gap_only() {
        return Decision::NoConflict;
    }

    // 5. an explicit gap request does not touch the record itself
    if req.precision == Precision::Gap && held.precision == Precision::RecNotGap {
        return Decision::NoConflict;
    }

    // 6. insert intentions never block anyone
    if held.precision == Precision::InsertIntention {
        return Decision::NoConflict;
    }

    // 7. step over a waiting exclusive request when the row is already held shared
    if req.mode == LockMode::Exclusive
        && req.precision.covers_record()
        && held.waiting
        && held.mode == LockMode::Exclusive
        && held.precision.covers_record()
        && req.holds_record_share
    {
        return Decision::Bypass;
    }

    // 8. wait
    Decision::Conflict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::bitmap::Bitmap;
    use crate::lock::PageId;
    use strum::IntoEnumIterator;

    fn held(
        trx: u64,
        mode: LockMode,
        precision: Precision,
        waiting: bool,
        heap_no: u32,
    ) -> RecordLock {
        let mut lock = RecordLock::new(
            trx,
            1,
            PageId::new(0, 1),
            mode,
            precision,
            waiting,
            false,
            heap_no,
            0,
        );
        lock.bitmap = Bitmap::single(heap_no);
        lock
    }

    fn req(trx: u64, mode: LockMode, precision: Precision, heap_no: u32) -> RecordRequest {
        RecordRequest {
            trx,
            mode,
            precision,
            heap_no,
            high_priority: false,
            holds_record_share: false,
        }
    }

    #[test]
    fn table_matrix_test() {
        use TableMode::*;

        // the matrix is symmetric
        for a in TableMode::iter() {
            for b in TableMode::iter() {
                assert_eq!(
                    table_modes_compatible(a, b),
                    table_modes_compatible(b, a),
                    "{:?} vs {:?}",
                    a,
                    b
                );
            }
        }

        // intention locks only ever conflict with S/X
        for a in [IntentionShared, IntentionExclusive].iter() {
            for b in TableMode::iter() {
                let expect = match (a, b) {
                    (IntentionShared, Exclusive) => false,
                    (IntentionExclusive, Shared) | (IntentionExclusive, Exclusive) => false,
                    _ => true,
                };
                assert_eq!(table_modes_compatible(*a, b), expect);
            }
        }

        // X is incompatible with everything
        for b in TableMode::iter() {
            assert!(!table_modes_compatible(Exclusive, b));
        }

        assert!(!table_modes_compatible(AutoInc, AutoInc));
        assert!(table_modes_compatible(AutoInc, IntentionExclusive));
    }

    #[test]
    fn own_and_shared_test() {
        let lock = held(1, LockMode::Exclusive, Precision::NextKey, false, 5);
        assert_eq!(
            record_conflict(&req(1, LockMode::Exclusive, Precision::NextKey, 5), &lock),
            Decision::NoConflict
        );

        let lock = held(2, LockMode::Shared, Precision::NextKey, false, 5);
        assert_eq!(
            record_conflict(&req(1, LockMode::Shared, Precision::NextKey, 5), &lock),
            Decision::NoConflict
        );
        assert_eq!(
            record_conflict(&req(1, LockMode::Exclusive, Precision::NextKey, 5), &lock),
            Decision::Conflict
        );
    }

    #[test]
    fn gap_insert_intention_test() {
        // gap locks exist to stop inserts: insert intention collides with them
        let gap = held(1, LockMode::Shared, Precision::Gap, false, 5);
        assert_eq!(
            record_conflict(
                &req(2, LockMode::Exclusive, Precision::InsertIntention, 5),
                &gap
            ),
            Decision::Conflict
        );

        // but an insert intention held by someone blocks nobody
        let ii = held(1, LockMode::Exclusive, Precision::InsertIntention, false, 5);
        assert_eq!(
            record_conflict(&req(2, LockMode::Exclusive, Precision::NextKey, 5), &ii),
            Decision::NoConflict
        );
        assert_eq!(
            record_conflict(
                &req(2, LockMode::Exclusive, Precision::InsertIntention, 5),
                &ii
            ),
            Decision::NoConflict
        );
    }

    #[test]
    fn gap_only_requests_block_on_nothing_test() {
        let x = held(1, LockMode::Exclusive, Precision::NextKey, false, 5);

        // explicit gap request
        assert_eq!(
            record_conflict(&req(2, LockMode::Exclusive, Precision::Gap, 5), &x),
            Decision::NoConflict
        );

        // supremum is implicitly gap-only
        let x_sup = held(1, LockMode::Exclusive, Precision::NextKey, false, 1);
        assert_eq!(
            record_conflict(&req(2, LockMode::Exclusive, Precision::NextKey, 1), &x_sup),
            Decision::NoConflict
        );
    }

    #[test]
    fn non_insert_intention_passes_gap_test() {
        let gap = held(1, LockMode::Exclusive, Precision::Gap, false, 5);
        assert_eq!(
            record_conflict(&req(2, LockMode::Exclusive, Precision::RecNotGap, 5), &gap),
            Decision::NoConflict
        );
        assert_eq!(
            record_conflict(&req(2, LockMode::Shared, Precision::NextKey, 5), &gap),
            Decision::NoConflict
        );
    }

    #[test]
    fn high_priority_ignores_waiters_test() {
        let waiting_x = held(1, LockMode::Exclusive, Precision::NextKey, true, 5);

        let mut r = req(2, LockMode::Exclusive, Precision::RecNotGap, 5);
        assert_eq!(record_conflict(&r, &waiting_x), Decision::Conflict);

        r.high_priority = true;
        assert_eq!(record_conflict(&r, &waiting_x), Decision::NoConflict);
    }

    #[test]
    fn bypass_waiting_exclusive_test() {
        let waiting_x = held(1, LockMode::Exclusive, Precision::NextKey, true, 5);

        let mut r = req(2, LockMode::Exclusive, Precision::RecNotGap, 5);
        assert_eq!(record_conflict(&r, &waiting_x), Decision::Conflict);

        // holding the row shared already lets the upgrade step over the waiter
        r.holds_record_share = true;
        assert_eq!(record_conflict(&r, &waiting_x), Decision::Bypass);

        // no bypass over a *granted* exclusive lock
        let granted_x = held(1, LockMode::Exclusive, Precision::NextKey, false, 5);
        assert_eq!(record_conflict(&r, &granted_x), Decision::Conflict);
    }
}
