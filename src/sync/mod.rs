//! Wait queues and wait objects: the blocking core under every
//! synchronisation primitive.
//!
//! A thread suspends on a queue until it is signalled, the queue is
//! broadcast or closed, or its deadline passes. A signal with no waiter is
//! remembered as *wake credit* (up to the queue's cap) and consumed by the
//! next arrival, so signal-then-wait never blocks. The wakeup/timeout race
//! is arbitrated by the wait object's `asserted` atomic: whichever side
//! swings it true -> false owns dequeuing the waiter; the loser's work is
//! a no-op.
//!
//! Lock order: wait-queue lock -> thread table -> ready queues, and
//! wait-queue lock -> time-event lock. Queue state is only touched at
//! `IPL_HIGH` with the queue's spinlock held.

pub mod condvar;
pub mod mutex;
pub mod semaphore;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use semaphore::Semaphore;

use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::{self, IPL_HIGH};
use crate::scheduler::{self, ThreadId, ThreadState, THREADS};
use crate::time::{self, EventId};

/// What a blocked thread is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Timer,
    Msg,
    Sem,
    Cond,
    Mutex,
    Queue,
}

/// Why a wait ended; written by the waking side, read by the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
    Closed,
}

/// Wait failures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed before a signal arrived.
    TimedOut,
    /// Non-blocking wait found no credit.
    WouldBlock,
    /// The queue is closed to new waiters.
    Closed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "wait timed out"),
            WaitError::WouldBlock => write!(f, "operation would block"),
            WaitError::Closed => write!(f, "wait queue is closed"),
        }
    }
}

/// Per-wait bookkeeping embedded in the TCB; lives for one blocking call.
pub struct WaitObj {
    /// Wakeup/timeout arbiter; see the module docs.
    pub(crate) asserted: AtomicBool,
    pub(crate) kind: Option<WaitKind>,
    /// Address of the queue the thread is parked on; 0 when not parked.
    /// The queue is guaranteed to outlive the wait (close drains waiters
    /// before a queue can be dropped).
    pub(crate) queue_addr: usize,
    /// Timeout event armed for this wait, if any.
    pub(crate) timer: Option<EventId>,
    pub(crate) outcome: WaitOutcome,
}

impl WaitObj {
    pub fn new() -> Self {
        WaitObj {
            asserted: AtomicBool::new(false),
            kind: None,
            queue_addr: 0,
            timer: None,
            outcome: WaitOutcome::Completed,
        }
    }

    /// Set up for a bare timer wait (`scheduler::sleep`).
    pub fn begin_timer_wait(&mut self) {
        self.kind = Some(WaitKind::Timer);
        self.queue_addr = 0;
        self.timer = None;
        self.outcome = WaitOutcome::Completed;
        self.asserted.store(false, Ordering::Relaxed);
    }
}

struct WaitInner {
    waiters: VecDeque<ThreadId>,
    /// Signals that arrived with nobody waiting.
    pending_wakes: u32,
    /// Upper bound on banked credit.
    credit_cap: u32,
    closed: bool,
}

/// A named queue threads can suspend on.
pub struct WaitQueue {
    inner: spin::Mutex<WaitInner>,
}

impl WaitQueue {
    /// Queue with no banked credit and the given credit cap.
    pub const fn new(credit_cap: u32) -> Self {
        Self::with_credit(0, credit_cap)
    }

    /// Queue pre-loaded with wake credit (semaphores seed their count).
    pub const fn with_credit(initial: u32, credit_cap: u32) -> Self {
        WaitQueue {
            inner: spin::Mutex::new(WaitInner {
                waiters: VecDeque::new(),
                pending_wakes: initial,
                credit_cap,
                closed: false,
            }),
        }
    }

    /// Suspend until signalled, closed, or `timeout_ns` elapses
    /// (0 = no deadline). With `nonblock`, never suspend: report
    /// `WouldBlock` unless credit is immediately available.
    pub fn wait(&self, kind: WaitKind, timeout_ns: u64, nonblock: bool) -> Result<(), WaitError> {
        self.wait_with(kind, timeout_ns, nonblock, || {})
    }

    /// [`WaitQueue::wait`] with a hook that runs after the thread is
    /// enqueued but before it suspends, with the queue lock released and
    /// the IPL still raised. The condition variable uses this to drop its
    /// companion mutex atomically with the enqueue.
    pub fn wait_with<F: FnOnce()>(
        &self,
        kind: WaitKind,
        timeout_ns: u64,
        nonblock: bool,
        before_block: F,
    ) -> Result<(), WaitError> {
        let ipl = cpu::raise_ipl(IPL_HIGH);
        let mut inner = self.inner.lock();

        if inner.closed {
            drop(inner);
            cpu::lower_ipl(ipl);
            return Err(WaitError::Closed);
        }
        if inner.pending_wakes > 0 {
            // Consume banked credit instead of enqueuing.
            inner.pending_wakes -= 1;
            drop(inner);
            cpu::lower_ipl(ipl);
            return Ok(());
        }
        if nonblock {
            drop(inner);
            cpu::lower_ipl(ipl);
            return Err(WaitError::WouldBlock);
        }

        let tid = scheduler::current();
        {
            let mut table = THREADS.lock();
            let thread = table.get_mut(tid).expect("waiting thread missing");
            thread.state = ThreadState::Waiting;
            thread.wait.kind = Some(kind);
            thread.wait.outcome = WaitOutcome::Completed;
            thread.wait.queue_addr = self as *const WaitQueue as usize;
            thread.wait.timer = None;
            thread.wait.asserted.store(true, Ordering::SeqCst);
        }
        inner.waiters.push_back(tid);

        if timeout_ns > 0 {
            let event = time::arm(
                time::now_ns() + timeout_ns,
                timeout_expired,
                tid.as_raw() as usize,
            );
            THREADS.lock().get_mut(tid).expect("waiting thread missing").wait.timer = Some(event);
        }
        drop(inner);

        before_block();
        scheduler::block();

        // Whoever woke us already removed us from the queue and recorded
        // why; just collect the verdict.
        let outcome = {
            let mut table = THREADS.lock();
            let thread = table.get_mut(tid).expect("woken thread missing");
            thread.wait.queue_addr = 0;
            thread.wait.timer = None;
            thread.wait.kind = None;
            thread.wait.outcome
        };
        cpu::lower_ipl(ipl);
        match outcome {
            WaitOutcome::Completed => Ok(()),
            WaitOutcome::TimedOut => Err(WaitError::TimedOut),
            WaitOutcome::Closed => Err(WaitError::Closed),
        }
    }

    /// Wake one waiter, or bank a wake credit if nobody is parked.
    pub fn signal(&self) {
        let ipl = cpu::raise_ipl(IPL_HIGH);
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            cpu::lower_ipl(ipl);
            return;
        }
        if !wake_head(&mut inner, WaitOutcome::Completed) {
            inner.pending_wakes = inner.pending_wakes.saturating_add(1).min(inner.credit_cap);
        }
        drop(inner);
        cpu::lower_ipl(ipl);
    }

    /// Wake every current waiter. Does not bank credit.
    pub fn broadcast(&self) {
        let ipl = cpu::raise_ipl(IPL_HIGH);
        let mut inner = self.inner.lock();
        while wake_head(&mut inner, WaitOutcome::Completed) {}
        drop(inner);
        cpu::lower_ipl(ipl);
    }

    /// Wake every waiter with `Closed` and refuse all future arrivals.
    pub fn close(&self) {
        let ipl = cpu::raise_ipl(IPL_HIGH);
        let mut inner = self.inner.lock();
        inner.closed = true;
        while wake_head(&mut inner, WaitOutcome::Closed) {}
        drop(inner);
        cpu::lower_ipl(ipl);
    }

    /// Banked wake credit (a semaphore's available count).
    pub fn pending_wakes(&self) -> u32 {
        self.inner.lock().pending_wakes
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Pop and wake the queue head. Caller holds the queue lock.
fn wake_head(inner: &mut WaitInner, outcome: WaitOutcome) -> bool {
    while let Some(tid) = inner.waiters.pop_front() {
        let mut table = THREADS.lock();
        let Some(thread) = table.get_mut(tid) else {
            // Stale entry; keep looking.
            continue;
        };
        // Claim the waiter. With the queue lock held the timeout path
        // cannot race us to the swap; a waiter it already claimed was also
        // already dequeued, so we cannot see it here.
        if thread
            .wait
            .asserted
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            thread.wait.outcome = outcome;
            let timer = thread.wait.timer.take();
            drop(table);
            if let Some(event) = timer {
                // False here means the timeout fired but lost the claim;
                // its callback is now a no-op.
                let _ = time::cancel(event);
            }
            scheduler::ready(tid);
            return true;
        }
    }
    false
}

/// Time-event callback for waits with a deadline. Runs at `IPL_HIGH`.
fn timeout_expired(arg: usize) {
    let tid = ThreadId::from_raw(arg as u32);

    // Look up where the waiter is parked, then re-validate under the
    // proper lock order (queue -> threads).
    let queue_addr = match THREADS.lock().get(tid) {
        Some(thread) => thread.wait.queue_addr,
        None => return,
    };
    if queue_addr == 0 {
        return;
    }
    let queue = unsafe { &*(queue_addr as *const WaitQueue) };

    let mut inner = queue.inner.lock();
    let mut table = THREADS.lock();
    let Some(thread) = table.get_mut(tid) else {
        return;
    };
    if thread.wait.queue_addr != queue_addr {
        // The wait ended and the slot moved on while we were looking.
        return;
    }
    if thread
        .wait
        .asserted
        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        if let Some(pos) = inner.waiters.iter().position(|&t| t == tid) {
            inner.waiters.remove(pos);
        }
        thread.wait.outcome = WaitOutcome::TimedOut;
        thread.wait.timer = None;
        drop(table);
        drop(inner);
        scheduler::ready(tid);
    }
}

#[cfg(test)]
pub(crate) mod testpark {
    //! Helpers for staging parked threads without running them.

    use super::*;
    use crate::scheduler::Thread;
    use alloc::vec;

    fn noop(_: usize) {}

    /// Insert a TCB that looks exactly like a thread suspended on `queue`.
    pub fn park_thread(name: &str, priority: u8, queue: &WaitQueue, kind: WaitKind) -> ThreadId {
        let tid = THREADS.lock().insert(Thread::new(
            name,
            priority,
            noop,
            0,
            vec![0u8; 64].into_boxed_slice(),
        ));
        {
            let mut table = THREADS.lock();
            let thread = table.get_mut(tid).unwrap();
            thread.state = ThreadState::Waiting;
            thread.wait.kind = Some(kind);
            thread.wait.outcome = WaitOutcome::Completed;
            thread.wait.queue_addr = queue as *const WaitQueue as usize;
            thread.wait.asserted.store(true, Ordering::SeqCst);
        }
        queue.inner.lock().waiters.push_back(tid);
        tid
    }

    /// State + outcome + run-queue presence snapshot, with rq cleanup.
    pub fn woken_state(tid: ThreadId) -> (ThreadState, WaitOutcome, bool) {
        let (state, outcome, priority) = {
            let table = THREADS.lock();
            let thread = table.get(tid).unwrap();
            (thread.state, thread.wait.outcome, thread.priority)
        };
        let queued = crate::cpu::ccb().rq.lock().remove(priority, tid);
        (state, outcome, queued)
    }
}

#[cfg(test)]
mod tests {
    use super::testpark::{park_thread, woken_state};
    use super::*;
    use crate::scheduler::test_lock;

    #[test]
    fn signal_before_wait_is_remembered() {
        let _guard = test_lock();
        let queue = WaitQueue::new(8);
        queue.signal();
        assert_eq!(queue.pending_wakes(), 1);
        // The credit satisfies the next wait without blocking.
        assert_eq!(queue.wait(WaitKind::Queue, 0, true), Ok(()));
        assert_eq!(queue.pending_wakes(), 0);
        assert_eq!(queue.wait(WaitKind::Queue, 0, true), Err(WaitError::WouldBlock));
    }

    #[test]
    fn wake_credit_is_bounded_by_the_cap() {
        let _guard = test_lock();
        let queue = WaitQueue::new(2);
        for _ in 0..5 {
            queue.signal();
        }
        assert_eq!(queue.pending_wakes(), 2);
    }

    #[test]
    fn a_cap_of_zero_drops_stray_signals() {
        let _guard = test_lock();
        let queue = WaitQueue::new(0);
        queue.signal();
        assert_eq!(queue.pending_wakes(), 0);
        assert_eq!(queue.wait(WaitKind::Cond, 0, true), Err(WaitError::WouldBlock));
    }

    #[test]
    fn closed_queues_turn_waiters_away() {
        let _guard = test_lock();
        let queue = WaitQueue::new(8);
        queue.close();
        assert_eq!(queue.wait(WaitKind::Queue, 0, false), Err(WaitError::Closed));
        // Signals on a closed queue bank nothing.
        queue.signal();
        assert_eq!(queue.pending_wakes(), 0);
    }

    #[test]
    fn signal_hands_the_wake_to_the_oldest_waiter() {
        let _guard = test_lock();
        let queue = WaitQueue::new(8);
        let first = park_thread("first", 5, &queue, WaitKind::Queue);
        let second = park_thread("second", 5, &queue, WaitKind::Queue);

        queue.signal();
        assert_eq!(queue.waiter_count(), 1);
        // Credit went to the waiter, not the bank.
        assert_eq!(queue.pending_wakes(), 0);

        let (state, outcome, queued) = woken_state(first);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(queued);

        // The second waiter is untouched.
        let table = THREADS.lock();
        assert_eq!(table.get(second).unwrap().state, ThreadState::Waiting);
        drop(table);

        queue.signal();
        let (state, _, queued) = woken_state(second);
        assert_eq!(state, ThreadState::Ready);
        assert!(queued);
    }

    #[test]
    fn broadcast_empties_the_queue_without_banking_credit() {
        let _guard = test_lock();
        let queue = WaitQueue::new(8);
        let a = park_thread("bcast-a", 4, &queue, WaitKind::Queue);
        let b = park_thread("bcast-b", 6, &queue, WaitKind::Queue);

        queue.broadcast();
        assert_eq!(queue.waiter_count(), 0);
        assert_eq!(queue.pending_wakes(), 0);
        for tid in [a, b] {
            let (state, outcome, queued) = woken_state(tid);
            assert_eq!(state, ThreadState::Ready);
            assert_eq!(outcome, WaitOutcome::Completed);
            assert!(queued);
        }
    }

    #[test]
    fn close_wakes_waiters_with_the_closed_verdict() {
        let _guard = test_lock();
        let queue = WaitQueue::new(8);
        let tid = park_thread("closee", 4, &queue, WaitKind::Queue);

        queue.close();
        assert_eq!(queue.waiter_count(), 0);
        let (state, outcome, queued) = woken_state(tid);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::Closed);
        assert!(queued);
    }

    #[test]
    fn timeout_steals_the_waiter_and_empties_the_queue() {
        let _guard = test_lock();
        let wheel = &crate::cpu::ccb().time;
        let queue = WaitQueue::new(8);
        let tid = park_thread("sleeper", 4, &queue, WaitKind::Queue);

        // Arm a 10 ms deadline exactly as wait() would.
        let deadline = wheel.now_ns() + 10_000_000;
        let event = wheel.arm(deadline, timeout_expired, tid.as_raw() as usize);
        THREADS.lock().get_mut(tid).unwrap().wait.timer = Some(event);

        // Let the clock pass the deadline, then deliver the tick.
        while wheel.now_ns() < deadline {
            wheel.hw().on_irq();
        }
        wheel.tick();

        assert_eq!(queue.waiter_count(), 0);
        let (state, outcome, queued) = woken_state(tid);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(queued);
        // The timer consumed itself: cancelling reports the race.
        assert!(!crate::time::cancel(event));
    }

    #[test]
    fn signal_cancels_the_timeout_it_beat() {
        let _guard = test_lock();
        let wheel = &crate::cpu::ccb().time;
        let queue = WaitQueue::new(8);
        let tid = park_thread("racer", 4, &queue, WaitKind::Queue);

        let deadline = wheel.now_ns() + 1_000_000_000;
        let event = wheel.arm(deadline, timeout_expired, tid.as_raw() as usize);
        THREADS.lock().get_mut(tid).unwrap().wait.timer = Some(event);

        queue.signal();
        let (state, outcome, queued) = woken_state(tid);
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(outcome, WaitOutcome::Completed);
        assert!(queued);
        // The event was cancelled; a later fire cannot exist.
        assert_eq!(THREADS.lock().get(tid).unwrap().wait.timer, None);
        assert!(!crate::time::cancel(event));
    }
}
