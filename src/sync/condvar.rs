//! Condition variable bound to a companion [`Mutex`].
//!
//! The mutex release and the enqueue happen atomically with respect to
//! signalers: the waiter enqueues itself under the queue lock at raised
//! IPL, then drops the mutex via the pre-block hook before suspending. A
//! zero credit cap means a notify with nobody waiting is forgotten, as
//! condition-variable semantics require.

use super::{Mutex, WaitError, WaitKind, WaitQueue};

pub struct CondVar {
    queue: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar {
            queue: WaitQueue::new(0),
        }
    }

    /// Atomically release `mutex` and suspend; reacquires the mutex before
    /// returning on every path, including error verdicts.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), WaitError> {
        let verdict = self
            .queue
            .wait_with(WaitKind::Cond, 0, false, || mutex.unlock());
        mutex.lock()?;
        verdict
    }

    /// [`CondVar::wait`] with a deadline. `TimedOut` is reported only
    /// after the mutex has been reacquired.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout_ns: u64) -> Result<(), WaitError> {
        let verdict = self
            .queue
            .wait_with(WaitKind::Cond, timeout_ns, false, || mutex.unlock());
        mutex.lock()?;
        verdict
    }

    /// Wake one waiter, if any.
    pub fn notify_one(&self) {
        self.queue.signal();
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.queue.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testpark::{park_thread, woken_state};
    use super::*;
    use crate::scheduler::{test_lock, ThreadState};
    use crate::sync::WaitOutcome;

    #[test]
    fn stray_notifications_are_forgotten() {
        let _guard = test_lock();
        let cv = CondVar::new();
        cv.notify_one();
        cv.notify_all();
        assert_eq!(cv.queue.pending_wakes(), 0);
        assert_eq!(
            cv.queue.wait(WaitKind::Cond, 0, true),
            Err(WaitError::WouldBlock)
        );
    }

    #[test]
    fn notify_one_wakes_exactly_one() {
        let _guard = test_lock();
        let cv = CondVar::new();
        let a = park_thread("cv-a", 5, &cv.queue, WaitKind::Cond);
        let b = park_thread("cv-b", 5, &cv.queue, WaitKind::Cond);

        cv.notify_one();
        assert_eq!(cv.queue.waiter_count(), 1);
        let (state, outcome, queued) = woken_state(a);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(queued);
        assert_eq!(
            crate::scheduler::THREADS.lock().get(b).unwrap().state,
            ThreadState::Waiting
        );

        cv.notify_all();
        let (state, _, queued) = woken_state(b);
        assert_eq!(state, ThreadState::Ready);
        assert!(queued);
    }
}
