//! Blocking mutex with ownership hand-off.
//!
//! The lock state is a one-credit wait queue: credit 1 = unlocked. A
//! contended unlock wakes one waiter *without* returning the credit, so
//! the lock passes directly to the woken thread and nobody can slip in
//! between the wake and its first instruction.

use core::sync::atomic::{AtomicU32, Ordering};

use super::{WaitError, WaitKind, WaitQueue};
use crate::cpu::NO_THREAD;

pub struct Mutex {
    queue: WaitQueue,
    /// Diagnostic owner id; not load-bearing for correctness.
    owner: AtomicU32,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            queue: WaitQueue::with_credit(1, 1),
            owner: AtomicU32::new(NO_THREAD),
        }
    }

    /// Acquire, suspending while another thread holds the lock.
    pub fn lock(&self) -> Result<(), WaitError> {
        self.queue.wait(WaitKind::Mutex, 0, false)?;
        self.owner
            .store(crate::scheduler::current().as_raw(), Ordering::Relaxed);
        Ok(())
    }

    /// Acquire without suspending.
    pub fn try_lock(&self) -> bool {
        if self.queue.wait(WaitKind::Mutex, 0, true).is_ok() {
            self.owner
                .store(crate::scheduler::current().as_raw(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Release. With waiters parked the lock transfers to the oldest one;
    /// otherwise it simply becomes free again.
    pub fn unlock(&self) {
        self.owner.store(NO_THREAD, Ordering::Relaxed);
        self.queue.signal();
    }

    pub fn is_locked(&self) -> bool {
        self.queue.pending_wakes() == 0
    }

    pub(super) fn wait_queue(&self) -> &WaitQueue {
        &self.queue
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testpark::{park_thread, woken_state};
    use super::*;
    use crate::scheduler::{test_lock, ThreadState};
    use crate::sync::WaitOutcome;

    #[test]
    fn uncontended_lock_unlock_round_trips() {
        let _guard = test_lock();
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock());
        assert!(mutex.is_locked());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock());
    }

    #[test]
    fn double_unlock_cannot_mint_extra_credit() {
        let _guard = test_lock();
        let mutex = Mutex::new();
        mutex.unlock();
        mutex.unlock();
        // Still exactly one lock's worth of credit.
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
    }

    #[test]
    fn contended_unlock_hands_the_lock_to_the_waiter() {
        let _guard = test_lock();
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        let waiter = park_thread("locker", 5, mutex.wait_queue(), WaitKind::Mutex);

        mutex.unlock();

        let (state, outcome, queued) = woken_state(waiter);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(queued);
        // Ownership moved to the waiter: the lock never became free.
        assert!(mutex.is_locked());
        assert!(!mutex.try_lock());
    }
}
