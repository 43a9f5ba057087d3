use lockstep::common::error::NonFatalError;
use lockstep::lock::mode::{LockMode, Precision, TableMode};
use lockstep::lock::{PageId, RecordId, HEAP_NO_SUPREMUM};
use lockstep::manager::{Grant, LockManager, WaitPolicy};
use lockstep::waits::WaitObserver;

use config::Config;
use lazy_static::lazy_static;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use rand::Rng;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static LOG: Once = Once::new();

/// Set up logger.
fn logging(on: bool) {
    if on {
        LOG.call_once(|| {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(Level::DEBUG)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("setting default subscriber failed");
        });
    }
}

lazy_static! {
    static ref SETTINGS: Config = {
        let mut c = Config::default();
        c.set("shards", 8i64).unwrap();
        c.set("max_locks", 10_000i64).unwrap();
        c.set("spin_rounds", 64i64).unwrap();
        c.set("cores", 4i64).unwrap();
        c
    };
}

fn manager() -> Arc<LockManager> {
    logging(false);
    Arc::new(LockManager::from_config(&SETTINGS).unwrap())
}

fn rec(page_no: u32, heap_no: u32) -> RecordId {
    RecordId::new(PageId::new(0, page_no), heap_no)
}

const X: LockMode = LockMode::Exclusive;
const S: LockMode = LockMode::Shared;

#[test]
fn conflicting_grant_wakes_waiter() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    assert_eq!(
        m.lock_record(1, 1, rec(1, 5), S, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::Granted
    );

    let waiter = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            assert_eq!(
                m.lock_record(2, 1, rec(1, 5), X, Precision::NextKey, WaitPolicy::Wait)
                    .unwrap(),
                Grant::WouldBlock
            );
            m.wait_for_grant(2, None)
        })
    };

    // give the waiter time to park, then release
    thread::sleep(Duration::from_millis(50));
    assert_eq!(m.wait_for_edge(2), Some(1));
    m.release_all(1).unwrap();
    waiter.join().unwrap().unwrap();

    let locks = m.locks_on(rec(1, 5));
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].trx(), 2);
    assert!(!locks[0].is_waiting());
    m.validate().unwrap();
}

#[test]
fn high_priority_waiter_granted_first() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false); // ordinary, arrives first
    m.register(3, true, false); // high priority, arrives second

    m.lock_record(1, 1, rec(2, 4), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    assert_eq!(
        m.lock_record(2, 1, rec(2, 4), X, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );
    assert_eq!(
        m.lock_record(3, 1, rec(2, 4), X, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );

    m.release_all(1).unwrap();

    // the high-priority waiter jumped the queue
    m.wait_for_grant(3, None).unwrap();
    let granted: Vec<u64> = m
        .locks_on(rec(2, 4))
        .iter()
        .filter(|l| !l.is_waiting())
        .map(|l| l.trx())
        .collect();
    assert_eq!(granted, vec![3]);

    // the passed-over waiter now points at the new holder
    assert_eq!(m.wait_for_edge(2), Some(3));

    m.release_all(3).unwrap();
    m.wait_for_grant(2, None).unwrap();
    m.release_all(2).unwrap();
    assert_eq!(m.live_locks(), 0);
    m.validate().unwrap();
}

#[test]
fn wait_timeout_cleans_up() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    m.lock_record(1, 1, rec(3, 2), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    assert_eq!(
        m.lock_record(2, 1, rec(3, 2), S, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );

    assert_eq!(
        m.wait_for_grant(2, Some(Duration::from_millis(50))),
        Err(NonFatalError::WaitTimeout)
    );

    // the wait left no residue
    assert_eq!(m.wait_for_edge(2), None);
    assert_eq!(m.locks_on(rec(3, 2)).len(), 1);
    assert_eq!(m.live_locks(), 1);
    m.validate().unwrap();
}

#[test]
fn cancelled_wait_reports_cancellation() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    m.lock_record(1, 1, rec(4, 2), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    m.lock_record(2, 1, rec(4, 2), S, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();

    assert!(m.cancel_wait(2).unwrap());
    assert_eq!(m.wait_for_grant(2, None), Err(NonFatalError::WaitCancelled));
    assert!(!m.cancel_wait(2).unwrap()); // nothing left to cancel
    m.validate().unwrap();
}

#[test]
fn deadlock_cycle_resolved_by_external_detector() {
    let m = manager();
    for id in 1..=3u64 {
        m.register(id, false, false);
    }

    // each transaction holds one record, then requests the next one round the
    // ring, forming a 3-cycle
    let pages = [rec(10, 2), rec(11, 2), rec(12, 2)];
    let mut handles = Vec::new();
    for i in 0..3usize {
        let m = Arc::clone(&m);
        let held = pages[i];
        let wanted = pages[(i + 1) % 3];
        let id = (i + 1) as u64;
        handles.push(thread::spawn(move || {
            m.lock_record(id, 1, held, X, Precision::NextKey, WaitPolicy::Wait)
                .unwrap();
            thread::sleep(Duration::from_millis(30)); // let everyone take their first lock
            let outcome = match m
                .lock_record(id, 1, wanted, X, Precision::NextKey, WaitPolicy::Wait)
                .unwrap()
            {
                Grant::WouldBlock => m.wait_for_grant(id, None),
                _ => Ok(()),
            };
            m.release_all(id).unwrap();
            outcome
        }));
    }

    // play the external detector: poll the published edges, find the cycle,
    // roll back one member
    let mut cycle = None;
    for _ in 0..200 {
        thread::sleep(Duration::from_millis(10));
        let graph = m.wait_graph();
        let mut g: DiGraphMap<u64, ()> = DiGraphMap::new();
        for e in &graph.edges {
            g.add_edge(e.waiter, e.blocker, ());
        }
        if let Some(c) = tarjan_scc(&g).into_iter().find(|scc| scc.len() > 1) {
            cycle = Some(c);
            break;
        }
    }
    let cycle = cycle.expect("no deadlock cycle observed");
    let victim = *cycle.iter().max().unwrap();
    m.rollback_victim(victim, &cycle).unwrap();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let deadlocks = outcomes
        .iter()
        .filter(|o| **o == Err(NonFatalError::Deadlock))
        .count();
    assert_eq!(deadlocks, 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 2);

    assert_eq!(m.live_locks(), 0);
    assert!(m.statistics().deadlocks >= 1);
    m.validate().unwrap();
}

struct RecordingObserver {
    edges: Arc<Mutex<Vec<(u64, u64)>>>,
    deadlocks: Arc<Mutex<Vec<(Vec<u64>, u64)>>>,
}

impl WaitObserver for RecordingObserver {
    fn on_edge(&self, waiter: u64, blocker: u64) {
        self.edges.lock().unwrap().push((waiter, blocker));
    }

    fn on_deadlock(&self, cycle: &[u64], victim: u64) {
        self.deadlocks.lock().unwrap().push((cycle.to_vec(), victim));
    }
}

#[test]
fn deadlock_resolution_reported_to_observer() {
    logging(false);
    let edges = Arc::new(Mutex::new(Vec::new()));
    let deadlocks = Arc::new(Mutex::new(Vec::new()));

    let mut m = LockManager::from_config(&SETTINGS).unwrap();
    m.set_observer(Box::new(RecordingObserver {
        edges: Arc::clone(&edges),
        deadlocks: Arc::clone(&deadlocks),
    }));
    m.register(1, false, false);
    m.register(2, false, false);

    // two-transaction cycle, built without parking anyone
    m.lock_record(1, 1, rec(45, 2), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    m.lock_record(2, 1, rec(46, 2), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    assert_eq!(
        m.lock_record(2, 1, rec(45, 2), X, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );
    assert_eq!(
        m.lock_record(1, 1, rec(46, 2), X, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );

    let graph = m.wait_graph();
    assert_eq!(graph.blocker_of(1), Some(2));
    assert_eq!(graph.blocker_of(2), Some(1));

    m.rollback_victim(2, &[1, 2]).unwrap();
    assert_eq!(m.wait_for_grant(2, None), Err(NonFatalError::Deadlock));
    m.wait_for_grant(1, None).unwrap();

    // the observer saw both live edges and the resolved cycle
    assert_eq!(
        deadlocks.lock().unwrap().as_slice(),
        &[(vec![1, 2], 2)]
    );
    let edges = edges.lock().unwrap();
    assert!(edges.contains(&(2, 1)));
    assert!(edges.contains(&(1, 2)));
    m.validate().unwrap();
}

#[test]
fn hit_list_preempts_ordinary_holders() {
    let m = manager();
    m.register(1, false, false); // ordinary holder
    m.register(2, true, false); // high priority

    m.lock_record(1, 1, rec(20, 3), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();

    let hits = m
        .make_hit_list(2, rec(20, 3), X, Precision::NextKey)
        .unwrap();
    let victims: Vec<u64> = hits.iter().copied().collect();
    assert_eq!(victims, vec![1]);

    for v in victims {
        m.rollback_victim(v, &[v]).unwrap();
    }

    assert_eq!(
        m.lock_record(2, 1, rec(20, 3), X, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::Granted
    );
    // the victim cannot take new locks until it rolls back
    assert_eq!(
        m.lock_record(1, 1, rec(20, 9), S, Precision::NextKey, WaitPolicy::Wait),
        Err(NonFatalError::Deadlock)
    );
    m.validate().unwrap();
}

#[test]
fn table_lock_waiters_wake_in_turn() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    m.lock_table(1, 5, TableMode::Shared, WaitPolicy::Wait).unwrap();

    let waiter = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            assert_eq!(
                m.lock_table(2, 5, TableMode::Exclusive, WaitPolicy::Wait).unwrap(),
                Grant::WouldBlock
            );
            m.wait_for_grant(2, None)
        })
    };

    thread::sleep(Duration::from_millis(50));
    m.release_all(1).unwrap();
    waiter.join().unwrap().unwrap();

    let entries = m.table_locks_on(5);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].trx(), 2);
    m.validate().unwrap();
}

#[test]
fn split_keeps_both_boundary_gaps_covered() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    let left = PageId::new(0, 30);
    let right = PageId::new(0, 31);

    // a next-key lock on the left supremum, and a next-key lock on what will
    // be the first record of the right page
    m.lock_record(
        1,
        1,
        RecordId::new(left, HEAP_NO_SUPREMUM),
        S,
        Precision::NextKey,
        WaitPolicy::Wait,
    )
    .unwrap();
    m.lock_record(2, 1, RecordId::new(right, 2), S, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();

    m.on_split_right(left, right, 2);

    // the supremum lock followed the upper records
    let right_sup = m.locks_on(RecordId::new(right, HEAP_NO_SUPREMUM));
    assert_eq!(right_sup.len(), 1);
    assert_eq!(right_sup[0].trx(), 1);

    // the left page's new end gap inherited coverage from the right page's
    // first record
    let left_sup = m.locks_on(RecordId::new(left, HEAP_NO_SUPREMUM));
    assert_eq!(left_sup.len(), 1);
    assert_eq!(left_sup[0].trx(), 2);
    assert_eq!(left_sup[0].precision(), Precision::Gap);

    assert!(m.statistics().inherited >= 1);
    m.validate().unwrap();
}

#[test]
fn merge_inherits_and_cancels_donor_waiters() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);
    m.register(3, false, false);

    let donor = PageId::new(0, 32);
    let receiver = PageId::new(0, 33);

    m.lock_record(
        1,
        1,
        RecordId::new(donor, HEAP_NO_SUPREMUM),
        S,
        Precision::Gap,
        WaitPolicy::Wait,
    )
    .unwrap();
    m.lock_record(2, 1, RecordId::new(donor, 2), X, Precision::RecNotGap, WaitPolicy::Wait)
        .unwrap();
    assert_eq!(
        m.lock_record(3, 1, RecordId::new(donor, 2), S, Precision::RecNotGap, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );

    m.on_merge(donor, receiver, 5);

    // the donor's end gap is now the heir's gap
    let heir = m.locks_on(RecordId::new(receiver, 5));
    assert_eq!(heir.len(), 1);
    assert_eq!(heir[0].trx(), 1);
    assert_eq!(heir[0].precision(), Precision::Gap);

    // the donor page has no lock state left, and its waiter re-resolves
    assert!(m.page_locks(donor).is_empty());
    assert_eq!(m.wait_for_grant(3, None), Err(NonFatalError::WaitCancelled));
    m.validate().unwrap();
}

#[test]
fn delete_inherits_to_heir_gap() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    m.lock_record(1, 1, rec(34, 3), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    m.lock_record(2, 1, rec(34, 3), S, Precision::RecNotGap, WaitPolicy::Wait)
        .unwrap();

    m.on_delete(rec(34, 3), rec(34, 4));

    let heir = m.locks_on(rec(34, 4));
    assert_eq!(heir.len(), 1);
    assert_eq!(heir[0].trx(), 1);
    assert_eq!(heir[0].precision(), Precision::Gap);
    assert!(m.locks_on(rec(34, 3)).is_empty());

    // the waiter on the purged record re-resolves
    assert_eq!(m.wait_for_grant(2, None), Err(NonFatalError::WaitCancelled));
    m.validate().unwrap();
}

#[test]
fn insert_inherits_gap_coverage_only() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    // next-key covers the gap below the successor; rec-not-gap does not
    m.lock_record(1, 1, rec(35, 4), S, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    m.lock_record(2, 1, rec(35, 4), S, Precision::RecNotGap, WaitPolicy::Wait)
        .unwrap();

    m.on_insert(rec(35, 3), rec(35, 4));

    let inherited = m.locks_on(rec(35, 3));
    assert_eq!(inherited.len(), 1);
    assert_eq!(inherited[0].trx(), 1);
    assert_eq!(inherited[0].precision(), Precision::Gap);
    m.validate().unwrap();
}

#[test]
fn reorganize_remaps_bitmaps_grants_first() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);
    m.register(3, false, false);

    m.lock_record(1, 1, rec(36, 2), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    m.lock_record(1, 1, rec(36, 5), X, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    // a waiter whose position survives, and one whose position vanishes
    m.lock_record(2, 1, rec(36, 5), S, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    m.lock_record(3, 1, rec(36, 6), S, Precision::NextKey, WaitPolicy::Wait)
        .unwrap();
    assert_eq!(
        m.lock_record(3, 1, rec(36, 6), S, Precision::NextKey, WaitPolicy::Wait)
            .unwrap(),
        Grant::AlreadyHeld
    );

    m.on_reorganize(PageId::new(0, 36), &[(2, 7), (5, 9)]);

    assert_eq!(m.locks_on(rec(36, 7)).len(), 1);
    assert!(m.locks_on(rec(36, 2)).is_empty());

    // trx 3's granted bit on heap 6 was not in the mapping and is gone
    assert!(m.locks_on(rec(36, 6)).is_empty());

    // the surviving waiter is queued on the remapped position
    let at_nine = m.locks_on(rec(36, 9));
    assert_eq!(at_nine.len(), 2);
    assert!(at_nine.iter().any(|l| l.trx() == 2 && l.is_waiting()));

    m.release_all(1).unwrap();
    m.wait_for_grant(2, None).unwrap();
    m.validate().unwrap();
}

#[test]
fn moved_records_take_their_locks_along() {
    let m = manager();
    m.register(1, false, false);
    m.register(2, false, false);

    let from = PageId::new(0, 37);
    let to = PageId::new(0, 38);

    m.lock_record(1, 1, RecordId::new(from, 2), S, Precision::RecNotGap, WaitPolicy::Wait)
        .unwrap();
    assert_eq!(
        m.lock_record(2, 1, RecordId::new(from, 2), X, Precision::RecNotGap, WaitPolicy::Wait)
            .unwrap(),
        Grant::WouldBlock
    );

    m.move_record_locks(from, to, &[(2, 4)]);

    assert!(m.page_locks(from).is_empty());
    let moved = m.locks_on(RecordId::new(to, 4));
    assert_eq!(moved.len(), 2);

    // the relocated wait resolves where the record now lives
    m.release_all(1).unwrap();
    m.wait_for_grant(2, None).unwrap();
    assert_eq!(m.locks_on(RecordId::new(to, 4)).len(), 1);
    m.validate().unwrap();
}

#[test]
fn randomized_traffic_leaves_consistent_state() {
    let m = manager();
    let threads = 4;
    let rounds = 200;

    let mut handles = Vec::new();
    for t in 0..threads {
        let m = Arc::clone(&m);
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for round in 0..rounds {
                let id = 1 + (t * rounds + round) as u64;
                m.register(id, false, false);

                for _ in 0..rng.gen_range(1..6) {
                    let page = rng.gen_range(50..54);
                    let heap = rng.gen_range(2..10);
                    let mode = if rng.gen_bool(0.5) { S } else { X };
                    let precision = match rng.gen_range(0..3) {
                        0 => Precision::NextKey,
                        1 => Precision::Gap,
                        _ => Precision::RecNotGap,
                    };
                    // refusal is fine, waiting is not wanted here
                    let _ = m.lock_record(id, 1, rec(page, heap), mode, precision, WaitPolicy::NoWait);
                }
                let _ = m.lock_table(id, 1, TableMode::IntentionShared, WaitPolicy::NoWait);

                m.release_all(id).unwrap();
                m.deregister(id);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(m.live_locks(), 0);
    m.validate().unwrap();
}
