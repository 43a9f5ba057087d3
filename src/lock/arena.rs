use crate::lock::record::RecordLock;

/// Handle to a record lock in a shard's arena.
///
/// Handles are `(index, generation)` pairs; a handle whose generation no
/// longer matches its slot refers to a lock that has been freed and means
/// "gone". This replaces pointer back-references between lock objects and
/// their owners with indices that can be validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRef {
    idx: u32,
    gen: u32,
}

#[derive(Debug)]
struct Slot {
    gen: u32,
    entry: Option<RecordLock>,
}

/// Generational arena holding one shard's record lock objects.
///
/// Freed slots are recycled through a free list, so lock allocation across
/// statements reuses storage instead of hitting the allocator.
#[derive(Debug)]
pub struct LockArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl LockArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, lock: RecordLock) -> LockRef {
        self.live += 1;

        match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.entry = Some(lock);
                LockRef {
                    idx,
                    gen: slot.gen,
                }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    entry: Some(lock),
                });
                LockRef { idx, gen: 0 }
            }
        }
    }

    pub fn get(&self, r: LockRef) -> Option<&RecordLock> {
        let slot = self.slots.get(r.idx as usize)?;
        if slot.gen != r.gen {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, r: LockRef) -> Option<&mut RecordLock> {
        let slot = self.slots.get_mut(r.idx as usize)?;
        if slot.gen != r.gen {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Free a lock; the slot's generation is bumped so outstanding handles go stale.
    pub fn remove(&mut self, r: LockRef) -> Option<RecordLock> {
        let slot = self.slots.get_mut(r.idx as usize)?;
        if slot.gen != r.gen {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(r.idx);
        self.live -= 1;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Default for LockArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::mode::{LockMode, Precision};
    use crate::lock::PageId;

    fn lock(trx: u64) -> RecordLock {
        RecordLock::new(
            trx,
            1,
            PageId::new(0, 1),
            LockMode::Shared,
            Precision::NextKey,
            false,
            false,
            2,
            0,
        )
    }

    #[test]
    fn insert_get_remove_test() {
        let mut arena = LockArena::new();
        let a = arena.insert(lock(1));
        let b = arena.insert(lock(2));
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.get(a).unwrap().trx(), 1);
        assert_eq!(arena.get(b).unwrap().trx(), 2);

        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.trx(), 1);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(a).is_none());
    }

    #[test]
    fn stale_generation_test() {
        let mut arena = LockArena::new();
        let a = arena.insert(lock(1));
        arena.remove(a).unwrap();

        // slot is recycled under a new generation; the old handle stays stale
        let b = arena.insert(lock(2));
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.get(b).unwrap().trx(), 2);
    }
}
