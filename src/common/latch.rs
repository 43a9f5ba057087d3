use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Spin rounds attempted before parking.
pub const DEFAULT_SPIN_ROUNDS: usize = 128;

/// A spin-then-park latch protecting shard or table state.
///
/// Latches are expected to be held briefly, so acquisition spins a bounded
/// number of rounds before parking on an OS-level primitive: spinning avoids
/// context-switch cost on the common case without burning cpu when a holder
/// is descheduled.
pub struct Latch<T> {
    locked: AtomicBool,
    spin_rounds: usize,
    sleepers: Mutex<usize>,
    cvar: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Latch<T> {}
unsafe impl<T: Send> Sync for Latch<T> {}

pub struct LatchGuard<'a, T> {
    latch: &'a Latch<T>,
}

impl<T> Latch<T> {
    pub fn new(data: T) -> Self {
        Self::with_spin_rounds(data, DEFAULT_SPIN_ROUNDS)
    }

    pub fn with_spin_rounds(data: T, spin_rounds: usize) -> Self {
        Self {
            locked: AtomicBool::new(false),
            spin_rounds,
            sleepers: Mutex::new(0),
            cvar: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) -> LatchGuard<'_, T> {
        for _ in 0..self.spin_rounds {
            if self.try_acquire() {
                return LatchGuard { latch: self };
            }
            std::hint::spin_loop();
        }

        // contended; park until a release notifies
        let mut sleepers = self.sleepers.lock();
        loop {
            if self.try_acquire() {
                return LatchGuard { latch: self };
            }
            *sleepers += 1;
            self.cvar.wait(&mut sleepers);
            *sleepers -= 1;
        }
    }

    pub fn try_lock(&self) -> Option<LatchGuard<'_, T>> {
        if self.try_acquire() {
            Some(LatchGuard { latch: self })
        } else {
            None
        }
    }
}

impl<'a, T> Deref for LatchGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.latch.data.get() }
    }
}

impl<'a, T> DerefMut for LatchGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.latch.data.get() }
    }
}

impl<'a, T> Drop for LatchGuard<'a, T> {
    fn drop(&mut self) {
        self.latch.locked.store(false, Ordering::Release);
        // releaser takes the sleeper lock after clearing, so a parked thread
        // either saw the latch free on retry or receives this notification
        let sleepers = self.latch.sleepers.lock();
        if *sleepers > 0 {
            self.latch.cvar.notify_one();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Latch {{ data: {:?} }}", &*guard),
            None => write!(f, "Latch {{ <locked> }}"),
        }
    }
}
