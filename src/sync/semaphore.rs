//! Counting semaphore: a wait queue whose banked wake credit *is* the
//! count.

use super::{WaitError, WaitKind, WaitQueue};

pub struct Semaphore {
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Semaphore {
            queue: WaitQueue::with_credit(count, u32::MAX),
        }
    }

    /// Take one unit, suspending until one is released.
    pub fn acquire(&self) -> Result<(), WaitError> {
        self.queue.wait(WaitKind::Sem, 0, false)
    }

    /// Take one unit or give up after `timeout_ns`.
    pub fn acquire_timeout(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.queue.wait(WaitKind::Sem, timeout_ns, false)
    }

    /// Take one unit without suspending.
    pub fn try_acquire(&self) -> Result<(), WaitError> {
        self.queue.wait(WaitKind::Sem, 0, true)
    }

    /// Return one unit, waking the oldest waiter if any.
    pub fn release(&self) {
        self.queue.signal();
    }

    /// Units currently available without blocking.
    pub fn available(&self) -> u32 {
        self.queue.pending_wakes()
    }

    /// Stop the semaphore; parked acquirers fail with `Closed`.
    pub fn close(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testpark::{park_thread, woken_state};
    use super::*;
    use crate::scheduler::{test_lock, ThreadState};
    use crate::sync::WaitOutcome;

    #[test]
    fn count_is_consumed_and_returned() {
        let _guard = test_lock();
        let sem = Semaphore::new(2);
        assert_eq!(sem.try_acquire(), Ok(()));
        assert_eq!(sem.try_acquire(), Ok(()));
        assert_eq!(sem.try_acquire(), Err(WaitError::WouldBlock));
        sem.release();
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.try_acquire(), Ok(()));
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn release_prefers_a_parked_acquirer_over_the_bank() {
        let _guard = test_lock();
        let sem = Semaphore::new(2);
        // Two units taken, a third acquirer parked.
        assert_eq!(sem.try_acquire(), Ok(()));
        assert_eq!(sem.try_acquire(), Ok(()));
        let third = park_thread("third", 5, &sem.queue, WaitKind::Sem);

        sem.release();

        let (state, outcome, queued) = woken_state(third);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(queued);
        // The unit went to the waiter, so nothing is banked.
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn closing_fails_new_acquirers() {
        let _guard = test_lock();
        let sem = Semaphore::new(0);
        sem.close();
        assert_eq!(sem.acquire(), Err(WaitError::Closed));
    }
}
