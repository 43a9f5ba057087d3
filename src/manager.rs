use crate::common::error::{FatalError, NonFatalError};
use crate::common::latch::DEFAULT_SPIN_ROUNDS;
use crate::common::relatch::relatch;
use crate::common::statistics::{Statistics, StatisticsSnapshot};
use crate::conflict::{record_conflict, table_modes_compatible, Decision, RecordRequest};
use crate::lock::mode::{LockMode, Precision, TableMode};
use crate::lock::record::RecordLock;
use crate::lock::table_lock::TableLock;
use crate::lock::{PageId, RecordId};
use crate::queue::{RecordShards, ShardState};
use crate::table_locks::{TableLocks, TableQueue};
use crate::trx::{OwnedLock, Transaction, WaitStatus};
use crate::waits::{choose_blocker, HitList, NoopObserver, WaitEdge, WaitGraph, WaitObserver};

use coarsetime::Clock;
use config::Config;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use scc::HashMap;
use std::cell::RefCell;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thread_local::ThreadLocal;
use tracing::{debug, info};

/// Outcome of a lock request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Grant {
    /// Granted immediately.
    Granted,

    /// An already-held lock satisfies the request.
    AlreadyHeld,

    /// A conflicting lock exists; a wait was enqueued and the caller should
    /// park in `wait_for_grant`.
    WouldBlock,
}

/// What to do when a request conflicts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitPolicy {
    Wait,
    NoWait,
    SkipLocked,
}

/// Represents the lock manager: record-lock shards, table-lock lists, and the
/// registry of active transactions.
pub struct LockManager {
    /// Sharded record-lock queues.
    rec: RecordShards,

    /// Per-table lock lists.
    tables: TableLocks,

    /// Active transactions.
    trxs: HashMap<u64, Arc<Transaction>, RandomState>,

    /// Shared for per-shard operations, exclusive for whole-structure
    /// operations (validation, victim rollback, table drop).
    global: RwLock<()>,

    stats: Statistics,

    /// Live lock objects, record and table, granted and waiting.
    live: AtomicUsize,

    /// Object budget; crossing it refuses the request.
    max_locks: usize,

    /// Arrival stamp source.
    seq: AtomicU64,

    observer: Box<dyn WaitObserver>,

    /// Recycled per-thread buffer for wait-for edge candidates.
    edge_scratch: ThreadLocal<RefCell<Vec<(u64, u64)>>>,
}

impl LockManager {
    pub fn new(shards: usize, max_locks: usize) -> Self {
        Self::with_settings(shards, max_locks, DEFAULT_SPIN_ROUNDS, num_cpus_hint())
    }

    pub fn with_settings(shards: usize, max_locks: usize, spin_rounds: usize, cores: usize) -> Self {
        Self {
            rec: RecordShards::new(shards, spin_rounds),
            tables: TableLocks::new(spin_rounds),
            trxs: HashMap::new(cores.max(1), RandomState::new()),
            global: RwLock::new(()),
            stats: Statistics::new(),
            live: AtomicUsize::new(0),
            max_locks,
            seq: AtomicU64::new(0),
            observer: Box::new(NoopObserver),
            edge_scratch: ThreadLocal::new(),
        }
    }

    /// Initialise from configuration.
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let shards = config.get_int("shards")? as usize;
        let max_locks = config.get_int("max_locks")? as usize;
        let spin_rounds = config.get_int("spin_rounds")? as usize;
        let cores = config.get_int("cores")? as usize;
        info!(
            "initialise lock manager: {} shards, {} max locks, {} spin rounds",
            shards, max_locks, spin_rounds
        );
        Ok(Self::with_settings(shards, max_locks, spin_rounds, cores))
    }

    /// Install the wait-for edge observer (external cycle detector feed).
    pub fn set_observer(&mut self, observer: Box<dyn WaitObserver>) {
        self.observer = observer;
    }

    /// Register a transaction. Id 0 is reserved as the "no blocker" sentinel.
    ///
    /// Registering an id twice returns the existing handle.
    pub fn register(&self, id: u64, high_priority: bool, read_only: bool) -> Arc<Transaction> {
        debug_assert!(id != 0, "transaction id 0 is reserved");
        debug!("register transaction {}", id);

        let trx = Arc::new(Transaction::new(id, high_priority, read_only));
        match self.trxs.insert(id, Arc::clone(&trx)) {
            Ok(_) => trx,
            Err(_) => self
                .trxs
                .read(&id, |_, v| Arc::clone(v))
                .unwrap_or(trx),
        }
    }

    /// Remove a transaction from the registry. Its locks must already have
    /// been released.
    pub fn deregister(&self, id: u64) {
        debug!("deregister transaction {}", id);
        self.trxs.remove(&id);
    }

    fn trx(&self, id: u64) -> Result<Arc<Transaction>, NonFatalError> {
        self.trxs
            .read(&id, |_, v| Arc::clone(v))
            .ok_or(NonFatalError::UnknownTransaction(id))
    }

    pub(crate) fn next_stamp(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Claim a slot in the object budget.
    fn reserve_slot(&self) -> Result<(), NonFatalError> {
        if self.live.fetch_add(1, Ordering::AcqRel) >= self.max_locks {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(NonFatalError::LockTableExhausted);
        }
        Ok(())
    }

    fn free_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.stats.inc_removed();
    }

    pub fn live_locks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // record locks
    // ------------------------------------------------------------------

    /// Request a record lock.
    ///
    /// `Ok(WouldBlock)` means a wait was enqueued; the caller parks in
    /// `wait_for_grant` and the grant scheduler resumes it.
    pub fn lock_record(
        &self,
        trx_id: u64,
        index: u64,
        rec: RecordId,
        mode: LockMode,
        precision: Precision,
        policy: WaitPolicy,
    ) -> Result<Grant, NonFatalError> {
        let trx = self.trx(trx_id)?;
        if trx.is_rollback_forced() {
            return Err(NonFatalError::Deadlock);
        }
        // the supremum has no record to lock
        debug_assert!(!(rec.is_supremum() && precision == Precision::RecNotGap));

        debug!(
            "transaction {} requesting {:?} {:?} lock on {}:{}",
            trx_id, mode, precision, rec.page, rec.heap_no
        );

        let _g = self.global.read();
        let shard = self.rec.shard_of(rec.page);
        let mut state = self.rec.shard(shard).lock();

        // fast path 1: nobody holds anything on this page
        if state.queue(rec.page).is_empty() {
            self.add_record_grant(&mut state, &trx, shard, index, rec, mode, precision)?;
            self.stats.inc_granted_immediate();
            return Ok(Grant::Granted);
        }

        // fast path 2: a single lock, ours, identical shape: set the bit
        let refs = state.queue_refs(rec.page);
        if refs.len() == 1 {
            if let Some(held) = state.lock(refs[0]) {
                if held.trx == trx_id
                    && !held.waiting
                    && held.mode == mode
                    && held.precision == precision
                    && held.index == index
                {
                    if held.covers(rec.heap_no) {
                        return Ok(Grant::AlreadyHeld);
                    }
                    let r = refs[0];
                    if let Some(held) = state.lock_mut(r) {
                        held.bitmap.set(rec.heap_no);
                    }
                    self.stats.inc_bit_reuses();
                    self.stats.inc_granted_immediate();
                    return Ok(Grant::Granted);
                }
            }
        }

        self.lock_record_slow(&mut state, &trx, shard, index, rec, mode, precision, policy)
    }

    /// Slow path: conflict scan over the page queue, expressed as the
    /// checking / bypassing / granting / waiting state machine.
    #[allow(clippy::too_many_arguments)]
    fn lock_record_slow(
        &self,
        state: &mut ShardState,
        trx: &Arc<Transaction>,
        shard: usize,
        index: u64,
        rec: RecordId,
        mode: LockMode,
        precision: Precision,
        policy: WaitPolicy,
    ) -> Result<Grant, NonFatalError> {
        enum Step {
            Checking,
            Bypassing,
            Granting,
            Waiting,
        }

        let refs = state.queue_refs(rec.page);

        // pass 1: own locks; strength short cut and reuse candidate
        let mut holds_record_share = false;
        let mut reusable = None;
        for &r in &refs {
            let held = match state.lock(r) {
                Some(held) => held,
                None => continue,
            };
            if held.trx != trx.id || held.waiting {
                continue;
            }
            if held.covers(rec.heap_no) {
                if held.mode.stronger_or_equal(mode) && held.precision.subsumes(precision) {
                    return Ok(Grant::AlreadyHeld);
                }
                if held.precision.covers_record() {
                    holds_record_share = true;
                }
            }
            if held.mode == mode && held.precision == precision && held.index == index {
                reusable = Some(r);
            }
        }

        // pass 2: conflict scan against everyone else
        let req = RecordRequest {
            trx: trx.id,
            mode,
            precision,
            heap_no: rec.heap_no,
            high_priority: trx.high_priority,
            holds_record_share,
        };

        let scratch = self.edge_scratch.get_or(|| RefCell::new(Vec::new()));
        let mut candidates = scratch.borrow_mut();
        candidates.clear();

        let mut step = Step::Checking;
        for &r in &refs {
            let held = match state.lock(r) {
                Some(held) => held,
                None => continue,
            };
            if held.trx == trx.id || !held.covers(rec.heap_no) {
                continue;
            }
            match record_conflict(&req, held) {
                Decision::NoConflict => {}
                Decision::Bypass => {
                    if let Step::Checking = step {
                        step = Step::Bypassing;
                    }
                }
                Decision::Conflict => {
                    candidates.push((held.trx, held.stamp));
                    step = Step::Waiting;
                }
            }
        }
        if !matches!(step, Step::Waiting) {
            step = Step::Granting;
        }

        match step {
            Step::Granting => {
                if let Some(r) = reusable {
                    if let Some(held) = state.lock_mut(r) {
                        held.bitmap.set(rec.heap_no);
                    }
                    self.stats.inc_bit_reuses();
                } else {
                    self.add_record_grant(state, trx, shard, index, rec, mode, precision)?;
                }
                self.stats.inc_granted_immediate();
                Ok(Grant::Granted)
            }
            Step::Waiting => match policy {
                WaitPolicy::NoWait => Err(NonFatalError::NoWaitConflict),
                WaitPolicy::SkipLocked => Err(NonFatalError::SkipLocked),
                WaitPolicy::Wait => {
                    self.reserve_slot()?;
                    let lock = RecordLock::new(
                        trx.id,
                        index,
                        rec.page,
                        mode,
                        precision,
                        true,
                        trx.high_priority,
                        rec.heap_no,
                        self.next_stamp(),
                    );
                    let r = state.push_lock(lock);
                    self.stats.inc_created();

                    {
                        let mut tl = trx.locks.lock();
                        debug_assert!(tl.waiting.is_none(), "second wait enqueued");
                        tl.waiting = Some(OwnedLock::Record {
                            shard,
                            page: rec.page,
                            lock: r,
                        });
                        tl.bump();
                    }
                    trx.slot.arm();

                    if let Some(blocker) = choose_blocker(trx, &candidates) {
                        trx.set_edge(blocker);
                        self.observer.on_edge(trx.id, blocker);
                        debug!("transaction {} waiting for {}", trx.id, blocker);
                    }
                    self.stats.inc_waits();
                    Ok(Grant::WouldBlock)
                }
            },
            Step::Checking | Step::Bypassing => unreachable!(),
        }
    }

    /// Allocate a granted lock, queue it ahead of waiters, attach it to its
    /// owner's lock list.
    fn add_record_grant(
        &self,
        state: &mut ShardState,
        trx: &Arc<Transaction>,
        shard: usize,
        index: u64,
        rec: RecordId,
        mode: LockMode,
        precision: Precision,
    ) -> Result<(), NonFatalError> {
        self.reserve_slot()?;
        let lock = RecordLock::new(
            trx.id,
            index,
            rec.page,
            mode,
            precision,
            false,
            trx.high_priority,
            rec.heap_no,
            self.next_stamp(),
        );
        let r = state.push_lock(lock);
        state.move_to_front(rec.page, r);
        self.stats.inc_created();

        let mut tl = trx.locks.lock();
        tl.owned.push(OwnedLock::Record {
            shard,
            page: rec.page,
            lock: r,
        });
        tl.bump();
        Ok(())
    }

    /// Park until an enqueued wait resolves. `timeout` of `None` waits
    /// indefinitely (the external detector is then the only way out of a
    /// cycle).
    pub fn wait_for_grant(
        &self,
        trx_id: u64,
        timeout: Option<Duration>,
    ) -> Result<(), NonFatalError> {
        let trx = self.trx(trx_id)?;
        let start = Clock::now_since_epoch();

        let status = match timeout {
            None => trx.slot.wait(),
            Some(limit) => match trx.slot.wait_for(limit) {
                Some(status) => status,
                None => {
                    // timed out; a grant may still slip in before the wait is
                    // torn down, in which case the grant wins
                    let _g = self.global.read();
                    if self.cancel_wait_with(&trx, WaitStatus::Timeout) {
                        WaitStatus::Timeout
                    } else {
                        trx.slot.wait()
                    }
                }
            },
        };

        let waited = Clock::now_since_epoch() - start;
        debug!(
            "transaction {} resumed after {}ns: {:?}",
            trx_id,
            waited.as_nanos(),
            status
        );

        match status {
            WaitStatus::Granted => Ok(()),
            WaitStatus::Deadlock => Err(NonFatalError::Deadlock),
            WaitStatus::Cancelled => Err(NonFatalError::WaitCancelled),
            WaitStatus::Timeout => Err(NonFatalError::WaitTimeout),
        }
    }

    /// Cancel an outstanding wait (statement kill). Returns whether a wait
    /// was actually torn down.
    pub fn cancel_wait(&self, trx_id: u64) -> Result<bool, NonFatalError> {
        let trx = self.trx(trx_id)?;
        let _g = self.global.read();
        Ok(self.cancel_wait_with(&trx, WaitStatus::Cancelled))
    }

    /// Tear down `trx`'s outstanding wait and wake it with `status`.
    /// Caller holds the global latch.
    fn cancel_wait_with(&self, trx: &Arc<Transaction>, status: WaitStatus) -> bool {
        // record wait
        let record = relatch(
            &trx.locks,
            |tl| match tl.waiting {
                Some(OwnedLock::Record { shard, page, lock }) => Some((shard, page, lock)),
                _ => None,
            },
            |&(shard, _, _)| self.rec.shard(shard).lock(),
            |&(_, page, lock), mut guard, tl| {
                tl.waiting = None;
                tl.bump();
                if guard.remove_lock(page, lock).is_some() {
                    self.free_slot();
                }
                (guard, page)
            },
        );
        if let Some((mut guard, page)) = record {
            trx.clear_edge();
            self.observer.on_edge_cleared(trx.id);
            trx.slot.wake(status);
            self.count_wait_end(status);
            self.rescan_record_grants(&mut guard, page);
            return true;
        }

        // table wait
        loop {
            let target = {
                let tl = trx.locks.lock();
                match tl.waiting {
                    Some(OwnedLock::Table { table, .. }) => Some((table, tl.version)),
                    _ => None,
                }
            };
            let (table, version) = match target {
                Some(t) => t,
                None => return false,
            };

            let handle = self.tables.table(table);
            let mut queue = handle.lock();
            let mut tl = trx.locks.lock();
            if tl.version != version {
                continue;
            }
            tl.waiting = None;
            tl.bump();
            drop(tl);

            if let Some(pos) = queue
                .list
                .iter()
                .position(|e| e.trx == trx.id && e.waiting)
            {
                queue.remove_at(pos);
                self.free_slot();
            }
            trx.clear_edge();
            self.observer.on_edge_cleared(trx.id);
            trx.slot.wake(status);
            self.count_wait_end(status);
            self.rescan_table_grants(&mut queue);
            return true;
        }
    }

    fn count_wait_end(&self, status: WaitStatus) {
        match status {
            WaitStatus::Timeout => self.stats.inc_timeouts(),
            WaitStatus::Cancelled => self.stats.inc_cancels(),
            WaitStatus::Deadlock => self.stats.inc_deadlocks(),
            WaitStatus::Granted => {}
        }
    }

    /// Release one granted record lock (read-committed early unlock).
    pub fn unlock_record(
        &self,
        trx_id: u64,
        rec: RecordId,
        mode: LockMode,
    ) -> Result<bool, NonFatalError> {
        let trx = self.trx(trx_id)?;
        let _g = self.global.read();
        let shard = self.rec.shard_of(rec.page);
        let mut state = self.rec.shard(shard).lock();

        let refs = state.queue_refs(rec.page);
        let mut released = false;
        for &r in &refs {
            let emptied = match state.lock_mut(r) {
                Some(held)
                    if held.trx == trx_id
                        && !held.waiting
                        && held.mode == mode
                        && held.covers(rec.heap_no) =>
                {
                    held.bitmap.clear(rec.heap_no);
                    released = true;
                    held.bitmap.is_empty()
                }
                _ => continue,
            };
            if emptied {
                state.remove_lock(rec.page, r);
                self.free_slot();
                let mut tl = trx.locks.lock();
                tl.owned.remove(OwnedLock::Record {
                    shard,
                    page: rec.page,
                    lock: r,
                });
                tl.bump();
            }
            break;
        }

        if released {
            debug!("transaction {} unlocked {}:{}", trx_id, rec.page, rec.heap_no);
            self.rescan_record_grants(&mut state, rec.page);
        }
        Ok(released)
    }

    // ------------------------------------------------------------------
    // table locks
    // ------------------------------------------------------------------

    /// Request a table lock.
    pub fn lock_table(
        &self,
        trx_id: u64,
        table: u64,
        mode: TableMode,
        policy: WaitPolicy,
    ) -> Result<Grant, NonFatalError> {
        let trx = self.trx(trx_id)?;
        if trx.is_rollback_forced() {
            return Err(NonFatalError::Deadlock);
        }
        debug!("transaction {} requesting {:?} lock on table {}", trx_id, mode, table);

        let _g = self.global.read();
        let handle = self.tables.table(table);
        let mut queue = handle.lock();

        // an equal or stronger grant already exists
        if queue
            .list
            .iter()
            .any(|e| e.trx == trx_id && !e.waiting && e.mode.stronger_or_equal(mode))
        {
            return Ok(Grant::AlreadyHeld);
        }

        // intention requests cannot conflict when no S/X entry exists
        let blocked = if mode.is_intention() && queue.no_shared_exclusive() {
            false
        } else {
            let scratch = self.edge_scratch.get_or(|| RefCell::new(Vec::new()));
            let mut candidates = scratch.borrow_mut();
            candidates.clear();
            for e in queue.list.iter() {
                if e.trx == trx_id || table_modes_compatible(mode, e.mode) {
                    continue;
                }
                if trx.high_priority && e.waiting && !e.high_priority {
                    continue;
                }
                candidates.push((e.trx, e.stamp));
            }
            if candidates.is_empty() {
                false
            } else {
                if policy == WaitPolicy::Wait {
                    if let Some(blocker) = choose_blocker(&trx, &candidates) {
                        trx.set_edge(blocker);
                        self.observer.on_edge(trx_id, blocker);
                    }
                }
                true
            }
        };

        if !blocked {
            self.reserve_slot()?;
            queue.push(TableLock::new(
                trx_id,
                table,
                mode,
                false,
                trx.high_priority,
                self.next_stamp(),
            ));
            self.stats.inc_created();
            let mut tl = trx.locks.lock();
            tl.owned.push(OwnedLock::Table { table, mode });
            tl.bump();
            drop(tl);
            self.stats.inc_granted_immediate();
            return Ok(Grant::Granted);
        }

        match policy {
            WaitPolicy::NoWait => Err(NonFatalError::NoWaitConflict),
            WaitPolicy::SkipLocked => Err(NonFatalError::SkipLocked),
            WaitPolicy::Wait => {
                self.reserve_slot()?;
                queue.push(TableLock::new(
                    trx_id,
                    table,
                    mode,
                    true,
                    trx.high_priority,
                    self.next_stamp(),
                ));
                self.stats.inc_created();

                let mut tl = trx.locks.lock();
                debug_assert!(tl.waiting.is_none(), "second wait enqueued");
                tl.waiting = Some(OwnedLock::Table { table, mode });
                tl.bump();
                drop(tl);
                trx.slot.arm();
                self.stats.inc_waits();
                Ok(Grant::WouldBlock)
            }
        }
    }

    /// Drop all lock state for a table (DDL drop, under the exclusive global
    /// latch). Waiters are woken with `Cancelled`.
    pub fn drop_table(&self, table: u64) {
        let _g = self.global.write();
        let handle = match self.tables.drop_table(table) {
            Some(handle) => handle,
            None => return,
        };
        let queue = handle.lock();
        for entry in queue.list.iter() {
            if let Ok(owner) = self.trx(entry.trx) {
                let mut tl = owner.locks.lock();
                if entry.waiting {
                    tl.waiting = None;
                } else {
                    tl.owned.remove(OwnedLock::Table {
                        table,
                        mode: entry.mode,
                    });
                }
                tl.bump();
                drop(tl);
                if entry.waiting {
                    owner.clear_edge();
                    self.observer.on_edge_cleared(entry.trx);
                    owner.slot.wake(WaitStatus::Cancelled);
                    self.stats.inc_cancels();
                }
            }
            self.free_slot();
        }
        info!("dropped lock state for table {}", table);
    }

    // ------------------------------------------------------------------
    // release
    // ------------------------------------------------------------------

    /// Release every lock held or waited for by a transaction
    /// (commit/rollback). Never fails once the transaction is known.
    pub fn release_all(&self, trx_id: u64) -> Result<(), NonFatalError> {
        let trx = self.trx(trx_id)?;
        debug!("release all locks of transaction {}", trx_id);

        // shut the door on new implicit conversions, then wait out those
        // already holding a pin
        {
            let mut tl = trx.locks.lock();
            tl.released = true;
        }
        trx.drain_pins();

        let _g = self.global.read();
        self.release_all_inner(&trx);
        Ok(())
    }

    /// Caller holds the global latch.
    fn release_all_inner(&self, trx: &Arc<Transaction>) {
        self.cancel_wait_with(trx, WaitStatus::Cancelled);
        self.release_records_inner(trx);
        self.release_tables_inner(trx);
        trx.clear_edge();
    }

    fn release_records_inner(&self, trx: &Arc<Transaction>) {
        loop {
            let released = relatch(
                &trx.locks,
                |tl| {
                    tl.owned.iter().rev().find_map(|e| match *e {
                        OwnedLock::Record { shard, page, lock } => Some((shard, page, lock)),
                        _ => None,
                    })
                },
                |&(shard, _, _)| self.rec.shard(shard).lock(),
                |&(shard, page, lock), mut guard, tl| {
                    tl.owned.remove(OwnedLock::Record { shard, page, lock });
                    tl.bump();
                    if guard.remove_lock(page, lock).is_some() {
                        self.free_slot();
                    }
                    (guard, page)
                },
            );
            match released {
                Some((mut guard, page)) => self.rescan_record_grants(&mut guard, page),
                None => break,
            }
        }
    }

    fn release_tables_inner(&self, trx: &Arc<Transaction>) {
        loop {
            let target = {
                let tl = trx.locks.lock();
                let found = tl
                    .owned
                    .iter()
                    .rev()
                    .find_map(|e| match *e {
                        OwnedLock::Table { table, mode } => Some((table, mode)),
                        _ => None,
                    })
                    .map(|t| (t, tl.version));
                found
            };
            let ((table, mode), version) = match target {
                Some(t) => t,
                None => break,
            };

            let handle = self.tables.table(table);
            let mut queue = handle.lock();
            let mut tl = trx.locks.lock();
            if tl.version != version {
                continue;
            }
            tl.owned.remove(OwnedLock::Table { table, mode });
            tl.bump();
            drop(tl);

            if let Some(pos) = queue
                .list
                .iter()
                .position(|e| e.trx == trx.id && e.mode == mode && !e.waiting)
            {
                queue.remove_at(pos);
                self.free_slot();
            }
            self.rescan_table_grants(&mut queue);
        }
    }

    // ------------------------------------------------------------------
    // grant scheduling
    // ------------------------------------------------------------------

    /// Re-examine a page's waiters after a removal. High-priority waiters go
    /// first in arrival order, then ordinary waiters by descending schedule
    /// weight; each candidate is re-checked against the granted locks.
    pub(crate) fn rescan_record_grants(&self, state: &mut ShardState, page: PageId) {
        let refs = state.queue_refs(page);

        let mut waiters: Vec<(crate::lock::arena::LockRef, bool, u64, u64)> = Vec::new();
        for &r in &refs {
            if let Some(l) = state.lock(r) {
                if l.waiting {
                    waiters.push((r, l.high_priority, l.weight, l.stamp));
                }
            }
        }
        if waiters.is_empty() {
            return;
        }
        waiters.sort_by(|a, b| {
            b.1.cmp(&a.1).then_with(|| {
                if a.1 {
                    a.3.cmp(&b.3)
                } else {
                    b.2.cmp(&a.2).then(a.3.cmp(&b.3))
                }
            })
        });

        let scratch = self.edge_scratch.get_or(|| RefCell::new(Vec::new()));

        for (r, hp, _, _) in waiters {
            let (wtrx, wmode, wprec, wheap) = match state.lock(r) {
                Some(l) => match l.wait_heap_no() {
                    Some(heap) => (l.trx, l.mode, l.precision, heap),
                    None => continue,
                },
                None => continue,
            };

            let mut holds_record_share = false;
            for &g in &refs {
                if let Some(held) = state.lock(g) {
                    if held.trx == wtrx
                        && !held.waiting
                        && held.covers(wheap)
                        && held.precision.covers_record()
                    {
                        holds_record_share = true;
                        break;
                    }
                }
            }

            let req = RecordRequest {
                trx: wtrx,
                mode: wmode,
                precision: wprec,
                heap_no: wheap,
                high_priority: hp,
                holds_record_share,
            };

            let mut candidates = scratch.borrow_mut();
            candidates.clear();
            for &g in &state.queue_refs(page) {
                if g == r {
                    continue;
                }
                let held = match state.lock(g) {
                    Some(held) => held,
                    None => continue,
                };
                if held.waiting || held.trx == wtrx || !held.covers(wheap) {
                    continue;
                }
                if record_conflict(&req, held) == Decision::Conflict {
                    candidates.push((held.trx, held.stamp));
                }
            }

            if candidates.is_empty() {
                if let Some(l) = state.lock_mut(r) {
                    l.waiting = false;
                }
                state.move_to_front(page, r);
                self.finish_grant(wtrx, OwnedLock::Record {
                    shard: self.rec.shard_of(page),
                    page,
                    lock: r,
                });
                debug!("granted waiting lock on {}:{} to {}", page, wheap, wtrx);
            } else {
                if let Some(l) = state.lock_mut(r) {
                    l.weight += 1; // passed over
                }
                if let Ok(owner) = self.trx(wtrx) {
                    if let Some(blocker) = choose_blocker(&owner, &candidates) {
                        if owner.wait_for_edge() != Some(blocker) {
                            owner.set_edge(blocker);
                            self.observer.on_edge(wtrx, blocker);
                        }
                    }
                }
            }
        }
    }

    /// Table-lock counterpart of the record rescan.
    fn rescan_table_grants(&self, queue: &mut TableQueue) {
        let mut waiters: Vec<(usize, bool, u64, u64)> = queue
            .list
            .iter()
            .enumerate()
            .filter(|(_, e)| e.waiting)
            .map(|(i, e)| (i, e.high_priority, e.weight, e.stamp))
            .collect();
        if waiters.is_empty() {
            return;
        }
        waiters.sort_by(|a, b| {
            b.1.cmp(&a.1).then_with(|| {
                if a.1 {
                    a.3.cmp(&b.3)
                } else {
                    b.2.cmp(&a.2).then(a.3.cmp(&b.3))
                }
            })
        });

        let scratch = self.edge_scratch.get_or(|| RefCell::new(Vec::new()));

        // indices stay valid: grants flip a flag in place, nothing is removed
        for (pos, _, _, _) in waiters {
            let (wtrx, wmode) = {
                let e = &queue.list[pos];
                (e.trx, e.mode)
            };

            let mut candidates = scratch.borrow_mut();
            candidates.clear();
            for e in queue.list.iter() {
                if e.trx == wtrx || e.waiting || table_modes_compatible(wmode, e.mode) {
                    continue;
                }
                candidates.push((e.trx, e.stamp));
            }

            if candidates.is_empty() {
                queue.list[pos].waiting = false;
                let table = queue.list[pos].table;
                self.finish_grant(wtrx, OwnedLock::Table { table, mode: wmode });
                debug!("granted waiting {:?} lock on table {} to {}", wmode, table, wtrx);
            } else {
                queue.list[pos].weight += 1;
                if let Ok(owner) = self.trx(wtrx) {
                    if let Some(blocker) = choose_blocker(&owner, &candidates) {
                        if owner.wait_for_edge() != Some(blocker) {
                            owner.set_edge(blocker);
                            self.observer.on_edge(wtrx, blocker);
                        }
                    }
                }
            }
        }
    }

    /// Move a completed wait into the owner's held list and wake it.
    fn finish_grant(&self, owner_id: u64, granted: OwnedLock) {
        if let Ok(owner) = self.trx(owner_id) {
            let mut tl = owner.locks.lock();
            if tl.waiting.take().is_some() {
                tl.owned.push(granted);
            }
            tl.bump();
            drop(tl);
            owner.clear_edge();
            self.observer.on_edge_cleared(owner_id);
            owner.slot.wake(WaitStatus::Granted);
        }
        self.stats.inc_granted_on_wait();
    }

    // ------------------------------------------------------------------
    // deadlock handling
    // ------------------------------------------------------------------

    /// Roll back a transaction chosen by the external cycle detector (or on
    /// a high-priority hit list): wake it with `Deadlock`, release all its
    /// locks, wake everyone it blocked. `cycle` is the wait-for cycle the
    /// detector resolved, passed through to the observer for logging; a
    /// hit-list rollback passes just the victim.
    pub fn rollback_victim(&self, victim_id: u64, cycle: &[u64]) -> Result<(), NonFatalError> {
        let victim = self.trx(victim_id)?;
        victim.rollback_forced.store(true, Ordering::Release);
        {
            let mut tl = victim.locks.lock();
            tl.released = true;
        }
        victim.drain_pins();
        info!("rolling back victim transaction {}", victim_id);
        self.observer.on_deadlock(cycle, victim_id);

        let _g = self.global.write();
        if self.cancel_wait_with(&victim, WaitStatus::Deadlock) {
            // cancel already counted the deadlock
        } else {
            victim.slot.wake(WaitStatus::Deadlock);
            self.stats.inc_deadlocks();
        }
        self.release_records_inner(&victim);
        self.release_tables_inner(&victim);
        victim.clear_edge();
        self.observer.on_edge_cleared(victim_id);
        Ok(())
    }

    /// Collect the low-priority transactions holding conflicting locks on a
    /// record into a hit list, marking each for forced rollback and
    /// cancelling its outstanding wait. The caller processes the list
    /// (rollback, wake) outside the manager's latches.
    pub fn make_hit_list(
        &self,
        trx_id: u64,
        rec: RecordId,
        mode: LockMode,
        precision: Precision,
    ) -> Result<HitList, NonFatalError> {
        let trx = self.trx(trx_id)?;
        let mut hits = HitList::new();

        {
            let _g = self.global.read();
            let shard = self.rec.shard_of(rec.page);
            let state = self.rec.shard(shard).lock();

            let req = RecordRequest {
                trx: trx_id,
                mode,
                precision,
                heap_no: rec.heap_no,
                high_priority: trx.high_priority,
                holds_record_share: false,
            };
            for &r in &state.queue_refs(rec.page) {
                let held = match state.lock(r) {
                    Some(held) => held,
                    None => continue,
                };
                if held.trx == trx_id || held.high_priority || !held.covers(rec.heap_no) {
                    continue;
                }
                if record_conflict(&req, held) == Decision::Conflict {
                    hits.insert(held.trx);
                }
            }
        }

        // mark victims under their own latches, then cancel their waits
        for &victim_id in hits.iter() {
            if let Ok(victim) = self.trx(victim_id) {
                let tl = victim.locks.lock();
                victim.rollback_forced.store(true, Ordering::Release);
                drop(tl);
                let _g = self.global.read();
                self.cancel_wait_with(&victim, WaitStatus::Deadlock);
            }
        }
        if !hits.is_empty() {
            info!("transaction {} hit list: {} victims", trx_id, hits.len());
        }
        Ok(hits)
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    /// Snapshot of the lock objects covering one record.
    pub fn locks_on(&self, rec: RecordId) -> Vec<RecordLock> {
        let _g = self.global.read();
        let state = self.rec.shard(self.rec.shard_of(rec.page)).lock();
        state
            .queue_refs(rec.page)
            .iter()
            .filter_map(|&r| state.lock(r))
            .filter(|l| l.covers(rec.heap_no))
            .cloned()
            .collect()
    }

    /// Snapshot of every lock object on a page, in queue order.
    pub fn page_locks(&self, page: PageId) -> Vec<RecordLock> {
        let _g = self.global.read();
        let state = self.rec.shard(self.rec.shard_of(page)).lock();
        state
            .queue_refs(page)
            .iter()
            .filter_map(|&r| state.lock(r))
            .cloned()
            .collect()
    }

    /// Snapshot of a table's lock list.
    pub fn table_locks_on(&self, table: u64) -> Vec<TableLock> {
        let _g = self.global.read();
        let handle = self.tables.table(table);
        let queue = handle.lock();
        queue.list.clone()
    }

    pub fn wait_for_edge(&self, trx_id: u64) -> Option<u64> {
        self.trxs.read(&trx_id, |_, v| v.wait_for_edge()).flatten()
    }

    /// All outgoing wait-for edges, for the external cycle detector.
    pub fn wait_graph(&self) -> WaitGraph {
        let mut graph = WaitGraph::default();
        self.trxs.for_each(|id, trx| {
            if let Some(blocker) = trx.wait_for_edge() {
                graph.edges.push(WaitEdge {
                    waiter: *id,
                    blocker,
                });
            }
        });
        graph
    }

    // ------------------------------------------------------------------
    // validation
    // ------------------------------------------------------------------

    /// Check structural invariants under the exclusive global latch.
    pub fn validate(&self) -> Result<(), FatalError> {
        let _g = self.global.write();

        let mut all: Vec<Arc<Transaction>> = Vec::new();
        self.trxs.for_each(|_, trx| all.push(Arc::clone(trx)));

        let mut waits_per_trx: FxHashMap<u64, usize> = FxHashMap::default();

        for idx in 0..self.rec.count() {
            let state = self.rec.shard(idx).lock();
            let mut seen = 0;
            for page in state.pages() {
                for &r in &state.queue_refs(page) {
                    seen += 1;
                    let lock = state.lock(r).ok_or_else(|| {
                        FatalError::BitmapQueueMismatch(format!(
                            "queue for {} holds a stale handle",
                            page
                        ))
                    })?;
                    if lock.page() != page {
                        return Err(FatalError::BitmapQueueMismatch(format!(
                            "lock of {} queued on {} but addresses {}",
                            lock.trx(),
                            page,
                            lock.page()
                        )));
                    }
                    if lock.is_waiting() {
                        if lock.wait_heap_no().is_none() {
                            return Err(FatalError::BitmapQueueMismatch(format!(
                                "waiting lock of {} on {} has {} bits",
                                lock.trx(),
                                page,
                                lock.bitmap.count()
                            )));
                        }
                        if self.trxs.read(&lock.trx(), |_, _| ()).is_none() {
                            return Err(FatalError::DanglingWait(lock.trx()));
                        }
                        *waits_per_trx.entry(lock.trx()).or_insert(0) += 1;
                    } else if lock.bitmap.count() == 0 {
                        return Err(FatalError::BitmapQueueMismatch(format!(
                            "granted lock of {} on {} has an empty bitmap",
                            lock.trx(),
                            page
                        )));
                    }
                    if lock.covers(crate::lock::HEAP_NO_SUPREMUM)
                        && lock.precision() == Precision::RecNotGap
                    {
                        return Err(FatalError::BitmapQueueMismatch(format!(
                            "rec-not-gap lock of {} covers the supremum of {}",
                            lock.trx(),
                            page
                        )));
                    }
                }
            }
            if seen != state.live_locks() {
                return Err(FatalError::BitmapQueueMismatch(format!(
                    "shard {}: {} queued handles but {} live locks",
                    idx,
                    seen,
                    state.live_locks()
                )));
            }
        }

        for table in self.tables.table_ids() {
            let handle = self.tables.table(table);
            let queue = handle.lock();
            if !queue.counters_agree() {
                return Err(FatalError::TableRefCountMismatch(table));
            }
            for entry in queue.list.iter().filter(|e| e.waiting) {
                if self.trxs.read(&entry.trx, |_, _| ()).is_none() {
                    return Err(FatalError::DanglingWait(entry.trx));
                }
                *waits_per_trx.entry(entry.trx).or_insert(0) += 1;
            }
        }

        for trx in &all {
            let n = waits_per_trx.get(&trx.id()).copied().unwrap_or(0);
            let tl = trx.locks.lock();
            let waiting = tl.waiting.is_some();
            drop(tl);
            if waiting && n == 0 {
                return Err(FatalError::DanglingWait(trx.id()));
            }
            if n > 1 || (!waiting && n > 0) {
                return Err(FatalError::MultipleWaits(trx.id(), n));
            }
            if let Some(blocker) = trx.wait_for_edge() {
                if !waiting || self.trxs.read(&blocker, |_, _| ()).is_none() {
                    return Err(FatalError::StaleWaitEdge(trx.id(), blocker));
                }
            }
        }

        Ok(())
    }

    // internals shared with the structural and implicit modules

    pub(crate) fn shards(&self) -> &RecordShards {
        &self.rec
    }

    pub(crate) fn global_latch(&self) -> &RwLock<()> {
        &self.global
    }

    pub(crate) fn trx_handle(&self, id: u64) -> Option<Arc<Transaction>> {
        self.trxs.read(&id, |_, v| Arc::clone(v))
    }

    pub(crate) fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub(crate) fn claim_slot_unchecked(&self) {
        // structural inheritance may exceed the budget; requests cannot
        self.live.fetch_add(1, Ordering::AcqRel);
        self.stats.inc_created();
    }

    pub(crate) fn release_slot(&self) {
        self.free_slot();
    }

    pub(crate) fn try_claim_slot(&self) -> Result<(), NonFatalError> {
        self.reserve_slot()?;
        self.stats.inc_created();
        Ok(())
    }

    pub(crate) fn observer(&self) -> &dyn WaitObserver {
        self.observer.as_ref()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("shards", &self.rec.count())
            .field("max_locks", &self.max_locks)
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

fn num_cpus_hint() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
