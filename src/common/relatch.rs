use crate::trx::TrxLocks;

use parking_lot::Mutex;

/// Latch order is shard before transaction. Paths that start from a
/// transaction's lock list therefore cannot take a shard latch while holding
/// the list latch; they must derive a target, drop the list latch, take the
/// shard latch, then retake and re-validate the list.
///
/// `derive` picks a target entry from the list (returning `None` ends the
/// loop), `latch` acquires the shard-side latch for that target, and `apply`
/// runs with both latches held. If the list version moved while the shard
/// latch was being taken the shard latch is dropped and the whole step
/// retried.
pub(crate) fn relatch<T, L, O>(
    trx: &Mutex<TrxLocks>,
    mut derive: impl FnMut(&TrxLocks) -> Option<T>,
    mut latch: impl FnMut(&T) -> L,
    mut apply: impl FnMut(&T, L, &mut TrxLocks) -> O,
) -> Option<O> {
    loop {
        let (target, version) = {
            let locks = trx.lock();
            match derive(&locks) {
                Some(target) => (target, locks.version),
                None => return None,
            }
        }; // list latch dropped here

        let guard = latch(&target);

        let mut locks = trx.lock();
        if locks.version != version {
            // list changed underneath us; the target may be gone
            drop(locks);
            drop(guard);
            continue;
        }

        return Some(apply(&target, guard, &mut locks));
    }
}
