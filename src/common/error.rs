//! There are two types of errors, (i) fatal errors, and (ii) non-fatal errors.
//! Fatal errors are internal invariant violations detected by validation; in normal
//! operation they are unreachable and their appearance terminates the engine.
//! Non-fatal errors are returned in response to lock requests and describe an
//! outcome the calling transaction is expected to handle (rollback, retry, skip).

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Represents a fatal error.
///
/// Produced only by whole-structure validation under the exclusive global latch.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub enum FatalError {
    /// A waiting lock has no conflicting lock left in its queue.
    DanglingWait(u64),

    /// A transaction owns more than one waiting lock.
    MultipleWaits(u64, usize),

    /// Conflicting granted locks from different transactions share a bit position.
    BitmapQueueMismatch(String),

    /// A table's per-mode counters disagree with its lock list.
    TableRefCountMismatch(u64),

    /// A wait-for edge points at a transaction that is no longer registered.
    StaleWaitEdge(u64, u64),
}

/// Represents a non-fatal error.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub enum NonFatalError {
    /// Transaction was chosen as deadlock victim and must roll back.
    Deadlock,

    /// Too many lock objects allocated system-wide.
    LockTableExhausted,

    /// Request conflicted and the caller opted out of waiting.
    NoWaitConflict,

    /// Request conflicted and the caller asked to skip locked rows.
    SkipLocked,

    /// Wait was cancelled (kill, forced rollback, row removed under the waiter).
    WaitCancelled,

    /// Wait exceeded the caller's timeout.
    WaitTimeout,

    /// Transaction id is not registered with the manager.
    UnknownTransaction(u64),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FatalError::*;
        match *self {
            DanglingWait(ref trx) => {
                write!(f, "waiting lock of transaction {} has no blocker", trx)
            }
            MultipleWaits(ref trx, ref n) => {
                write!(f, "transaction {} owns {} waiting locks", trx, n)
            }
            BitmapQueueMismatch(ref s) => write!(f, "bitmap/queue mismatch: {}", s),
            TableRefCountMismatch(ref table) => {
                write!(f, "lock counters disagree with lock list on table {}", table)
            }
            StaleWaitEdge(ref waiter, ref blocker) => write!(
                f,
                "wait-for edge {} -> {} points at unregistered transaction",
                waiter, blocker
            ),
        }
    }
}

impl fmt::Display for NonFatalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use NonFatalError::*;
        match *self {
            Deadlock => write!(f, "deadlock victim; transaction must roll back"),
            LockTableExhausted => write!(f, "lock table exhausted"),
            NoWaitConflict => write!(f, "conflict and nowait requested"),
            SkipLocked => write!(f, "row locked and skip locked requested"),
            WaitCancelled => write!(f, "lock wait cancelled"),
            WaitTimeout => write!(f, "lock wait timeout"),
            UnknownTransaction(ref id) => write!(f, "unknown transaction {}", id),
        }
    }
}

impl Error for FatalError {}

impl Error for NonFatalError {}
