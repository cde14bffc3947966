//! Preemptive priority scheduler.
//!
//! Fixed priorities, one ready queue per level, O(1) highest-priority
//! lookup through an occupancy bitmask. Threads lose the CPU only at
//! explicit suspension points (blocking, yielding, or the timer tick
//! preempting them), and preemption itself can be deferred through the
//! CCB's preemption gate: while the gate is closed a preemption request
//! is latched and honoured when the gate reopens.
//!
//! Lock order: wait queue -> thread table -> ready queues. The thread
//! arena boxes every TCB so context pointers extracted under the lock
//! stay valid while the switch runs without it.

pub mod context;
pub mod thread;

use alloc::collections::VecDeque;
use alloc::vec;
use core::sync::atomic::{AtomicBool, Ordering};

use bit_field::BitField;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::cpu::{self, IPL_HIGH};
use context::{enter_context, switch_context, CpuContext};
pub use thread::{Thread, ThreadId, ThreadState, ThreadTable, PRIO_DEFAULT, PRIO_LEVELS};

lazy_static! {
    /// Every live TCB in the system.
    pub static ref THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable::new());
}

/// Set once the boot path has become thread 0; until then wakeups only
/// queue and never context-switch.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Per-priority ready queues with an occupancy bitmask.
pub struct RunQueues {
    queues: [VecDeque<ThreadId>; PRIO_LEVELS],
    occupied: u32,
}

impl RunQueues {
    pub fn new() -> Self {
        const EMPTY: VecDeque<ThreadId> = VecDeque::new();
        RunQueues {
            queues: [EMPTY; PRIO_LEVELS],
            occupied: 0,
        }
    }

    pub fn enqueue(&mut self, priority: u8, tid: ThreadId) {
        debug_assert!((priority as usize) < PRIO_LEVELS);
        self.queues[priority as usize].push_back(tid);
        self.occupied.set_bit(priority as usize, true);
    }

    /// Pop the head of the most important non-empty queue.
    pub fn dequeue_highest(&mut self) -> Option<ThreadId> {
        let priority = self.highest()?;
        let queue = &mut self.queues[priority as usize];
        let tid = queue.pop_front();
        if queue.is_empty() {
            self.occupied.set_bit(priority as usize, false);
        }
        tid
    }

    /// Most important priority with a ready thread.
    pub fn highest(&self) -> Option<u8> {
        if self.occupied == 0 {
            None
        } else {
            Some((31 - self.occupied.leading_zeros()) as u8)
        }
    }

    /// Is anything ready at `priority` or above?
    pub fn has_ready_at_or_above(&self, priority: u8) -> bool {
        self.highest().map_or(false, |p| p >= priority)
    }

    pub fn contains(&self, priority: u8, tid: ThreadId) -> bool {
        self.queues[priority as usize].contains(&tid)
    }

    /// Drop a specific thread from its queue (e.g. when it is killed while
    /// ready). Returns whether it was queued.
    pub fn remove(&mut self, priority: u8, tid: ThreadId) -> bool {
        let queue = &mut self.queues[priority as usize];
        let Some(pos) = queue.iter().position(|&t| t == tid) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.occupied.set_bit(priority as usize, false);
        }
        true
    }

    /// Queue position of `tid` within its priority, for tests and dumps.
    pub fn position(&self, priority: u8, tid: ThreadId) -> Option<usize> {
        self.queues[priority as usize].iter().position(|&t| t == tid)
    }
}

/// What a wakeup at `new_prio` should do to the running thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreemptAction {
    /// Keep running; the new thread waits its turn.
    None,
    /// Latch a request; an interrupt or closed gate blocks switching now.
    Defer,
    /// Yield on the spot.
    Now,
}

fn preempt_action(
    new_prio: u8,
    cur_prio: u8,
    active: bool,
    gate_closed: bool,
    in_irq: bool,
) -> PreemptAction {
    if !active || new_prio <= cur_prio {
        PreemptAction::None
    } else if gate_closed || in_irq {
        PreemptAction::Defer
    } else {
        PreemptAction::Now
    }
}

/// Install thread 0 (the boot path itself) and the idle thread.
pub fn init() {
    let ccb = cpu::ccb();
    let mut table = THREADS.lock();

    let boot = Thread::new("kmain", PRIO_DEFAULT, |_| {}, 0, vec![].into_boxed_slice());
    let boot_tid = table.insert(boot);
    table.get_mut(boot_tid).unwrap().state = ThreadState::Running;

    let idle = Thread::new(
        "idle",
        0,
        idle_main,
        0,
        vec![0u8; thread::STACK_SIZE].into_boxed_slice(),
    );
    let idle_tid = table.insert(idle);
    // The idle thread never sits in a ready queue; the dispatcher falls
    // back to it when every queue is empty.
    table.get_mut(idle_tid).unwrap().state = ThreadState::Ready;
    drop(table);

    ccb.cur_thread.store(boot_tid.as_raw(), Ordering::Relaxed);
    ccb.cur_prio.store(PRIO_DEFAULT, Ordering::Relaxed);
    ccb.idle_thread.store(idle_tid.as_raw(), Ordering::Relaxed);
    ACTIVE.store(true, Ordering::Relaxed);

    crate::log_info!("Scheduler online, {} priority levels", PRIO_LEVELS);
}

/// Create a kernel thread and make it ready.
pub fn spawn(name: &str, priority: u8, entry: fn(usize), arg: usize) -> ThreadId {
    let stack = vec![0u8; thread::STACK_SIZE].into_boxed_slice();
    let tid = THREADS.lock().insert(Thread::new(name, priority, entry, arg, stack));
    ready(tid);
    tid
}

/// Id of the running thread.
pub fn current() -> ThreadId {
    ThreadId::from_raw(cpu::ccb().cur_thread.load(Ordering::Relaxed))
}

/// Make `tid` runnable and resolve whether it should take the CPU.
pub fn ready(tid: ThreadId) {
    let ipl = cpu::raise_ipl(IPL_HIGH);
    let priority = {
        let mut table = THREADS.lock();
        let thread = table.get_mut(tid).expect("readying a dead thread");
        debug_assert_ne!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Ready;
        thread.priority
    };
    let ccb = cpu::ccb();
    ccb.rq.lock().enqueue(priority, tid);

    let action = preempt_action(
        priority,
        ccb.cur_prio.load(Ordering::Relaxed),
        ACTIVE.load(Ordering::Relaxed),
        ccb.preempt_disable.load(Ordering::Relaxed) > 0,
        cpu::in_interrupt(),
    );
    cpu::lower_ipl(ipl);
    match action {
        PreemptAction::Now => yield_now(),
        PreemptAction::Defer => ccb.preempt_req.store(true, Ordering::Relaxed),
        PreemptAction::None => {}
    }
}

/// Give up the CPU; the current thread goes to the back of its own queue.
pub fn yield_now() {
    if !ACTIVE.load(Ordering::Relaxed) {
        return;
    }
    reschedule(SwitchMode::Requeue);
}

/// Suspend the current thread. The caller has already parked it on a wait
/// queue (or armed a timer) and set its state to `Waiting`.
pub fn block() {
    debug_assert!(ACTIVE.load(Ordering::Relaxed));
    reschedule(SwitchMode::Block);
}

/// Terminate the current thread. Its TCB is reaped by the idle thread.
pub fn exit_current() -> ! {
    reschedule(SwitchMode::Exit);
    unreachable!("terminated thread was rescheduled");
}

/// Timer-tick hook: quantum accounting plus any deferred preemption.
pub fn preempt() {
    if !ACTIVE.load(Ordering::Relaxed) {
        return;
    }
    let ccb = cpu::ccb();
    let cur_tid = current();
    let mut expired = false;
    {
        let mut table = THREADS.lock();
        if let Some(cur) = table.get_mut(cur_tid) {
            cur.quantum_left = cur.quantum_left.saturating_sub(1);
            if cur.quantum_left == 0 {
                if ccb.rq.lock().has_ready_at_or_above(cur.priority) {
                    cur.preempted = true;
                    expired = true;
                } else {
                    // Alone at this priority: run on with a fresh quantum.
                    cur.quantum_left = cur.quantum_total;
                }
            }
        }
    }

    if expired || ccb.preempt_req.load(Ordering::Relaxed) {
        if ccb.preempt_disable.load(Ordering::Relaxed) == 0 {
            ccb.preempt_req.store(false, Ordering::Relaxed);
            yield_now();
        } else {
            ccb.preempt_req.store(true, Ordering::Relaxed);
        }
    }
}

/// Close the preemption gate.
pub fn disable_preempt() {
    cpu::ccb().preempt_disable.fetch_add(1, Ordering::Relaxed);
}

/// Reopen the preemption gate, honouring a latched request.
pub fn enable_preempt() {
    let ccb = cpu::ccb();
    let prev = ccb.preempt_disable.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "preemption gate underflow");
    if prev == 1
        && ACTIVE.load(Ordering::Relaxed)
        && ccb.preempt_req.swap(false, Ordering::Relaxed)
    {
        yield_now();
    }
}

/// Park the current thread for at least `duration_ns`.
pub fn sleep(duration_ns: u64) {
    let tid = current();
    let ipl = cpu::raise_ipl(IPL_HIGH);
    {
        let mut table = THREADS.lock();
        let thread = table.get_mut(tid).expect("sleeping thread missing");
        thread.state = ThreadState::Waiting;
        thread.wait.begin_timer_wait();
    }
    let deadline = crate::time::now_ns() + duration_ns;
    crate::time::arm(deadline, sleep_wakeup, tid.as_raw() as usize);
    block();
    cpu::lower_ipl(ipl);
}

fn sleep_wakeup(arg: usize) {
    ready(ThreadId::from_raw(arg as u32));
}

enum SwitchMode {
    Requeue,
    Block,
    Exit,
}

fn reschedule(mode: SwitchMode) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let ccb = cpu::ccb();
        let cur_tid = current();
        let idle_tid = ThreadId::from_raw(ccb.idle_thread.load(Ordering::Relaxed));
        let now = ccb.time.now_ns();

        let mut table = THREADS.lock();
        let mut rq = ccb.rq.lock();

        {
            let cur = table.get_mut(cur_tid).expect("current thread missing");
            match mode {
                SwitchMode::Requeue => {
                    if cur.state == ThreadState::Running {
                        cur.state = ThreadState::Ready;
                        if cur_tid != idle_tid {
                            rq.enqueue(cur.priority, cur_tid);
                        }
                    }
                }
                SwitchMode::Block => {
                    debug_assert_eq!(cur.state, ThreadState::Waiting);
                }
                SwitchMode::Exit => {
                    cur.state = ThreadState::Terminated;
                }
            }
        }

        let next_tid = rq.dequeue_highest().unwrap_or(idle_tid);
        if next_tid == cur_tid {
            // Nothing more important; take the CPU straight back.
            table.get_mut(cur_tid).unwrap().state = ThreadState::Running;
            return;
        }

        // Box-backed TCBs have stable addresses; the context pointers
        // taken here stay valid after the locks drop, which the switch
        // itself requires.
        let cur_ctx: *mut CpuContext = {
            let cur = table.get_mut(cur_tid).expect("current thread missing");
            cur.run_time_ns += now.saturating_sub(cur.last_schedule_ns);
            &mut cur.context
        };
        let next_ctx: *const CpuContext = {
            let next = table.get_mut(next_tid).expect("picked thread missing");
            next.state = ThreadState::Running;
            next.last_schedule_ns = now;
            next.quantum_left = next.quantum_total;
            ccb.cur_thread.store(next_tid.as_raw(), Ordering::Relaxed);
            ccb.cur_prio.store(next.priority, Ordering::Relaxed);
            &next.context
        };
        drop(rq);
        drop(table);

        match mode {
            SwitchMode::Exit => unsafe { enter_context(next_ctx) },
            _ => unsafe { switch_context(cur_ctx, next_ctx) },
        }
    });
}

/// First code every spawned thread runs.
pub(crate) extern "C" fn thread_startup() -> ! {
    let (entry, arg) = {
        let table = THREADS.lock();
        let thread = table.get(current()).expect("starting thread missing");
        (thread.entry, thread.arg)
    };
    // The switch that got us here ran fully masked; open the gate before
    // entering thread code.
    cpu::lower_ipl(cpu::IPL_LOW);
    entry(arg);
    exit_current();
}

fn idle_main(_arg: usize) {
    loop {
        reap_terminated();
        x86_64::instructions::hlt();
    }
}

/// Free TCBs of threads that have exited. Runs in the idle thread, which
/// is never the one being freed.
fn reap_terminated() {
    let mut table = THREADS.lock();
    for tid in table.terminated() {
        if tid != current() {
            table.remove(tid);
        }
    }
}

/// Serialises tests that stage global scheduler/CCB state.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    fn insert_thread(name: &str, priority: u8) -> ThreadId {
        THREADS.lock().insert(Thread::new(
            name,
            priority,
            noop,
            0,
            vec![0u8; 64].into_boxed_slice(),
        ))
    }

    #[test]
    fn run_queues_pick_highest_priority_first() {
        let mut rq = RunQueues::new();
        let low = ThreadId::new(1, 0);
        let mid = ThreadId::new(2, 0);
        let high = ThreadId::new(3, 0);
        rq.enqueue(3, low);
        rq.enqueue(20, high);
        rq.enqueue(10, mid);

        assert_eq!(rq.highest(), Some(20));
        assert_eq!(rq.dequeue_highest(), Some(high));
        assert_eq!(rq.dequeue_highest(), Some(mid));
        assert_eq!(rq.dequeue_highest(), Some(low));
        assert_eq!(rq.dequeue_highest(), None);
        assert_eq!(rq.highest(), None);
    }

    #[test]
    fn equal_priority_is_round_robin_order() {
        let mut rq = RunQueues::new();
        let a = ThreadId::new(1, 0);
        let b = ThreadId::new(2, 0);
        rq.enqueue(5, a);
        rq.enqueue(5, b);
        assert_eq!(rq.dequeue_highest(), Some(a));
        // A preempted thread goes to the back of its own queue.
        rq.enqueue(5, a);
        assert_eq!(rq.position(5, a), Some(1));
        assert_eq!(rq.dequeue_highest(), Some(b));
        assert_eq!(rq.dequeue_highest(), Some(a));
    }

    #[test]
    fn occupancy_mask_survives_interleaved_traffic() {
        let mut rq = RunQueues::new();
        let a = ThreadId::new(1, 0);
        let b = ThreadId::new(2, 0);
        rq.enqueue(31, a);
        rq.enqueue(0, b);
        assert!(rq.has_ready_at_or_above(31));
        assert_eq!(rq.dequeue_highest(), Some(a));
        assert!(!rq.has_ready_at_or_above(1));
        assert!(rq.has_ready_at_or_above(0));
        assert_eq!(rq.dequeue_highest(), Some(b));
    }

    #[test]
    fn wakeup_decision_matrix() {
        use PreemptAction::*;
        // Equal or lower priority never preempts.
        assert_eq!(preempt_action(3, 3, true, false, false), None);
        assert_eq!(preempt_action(2, 3, true, false, false), None);
        // Higher priority preempts immediately in thread context.
        assert_eq!(preempt_action(5, 3, true, false, false), Now);
        // A closed gate or interrupt context defers it.
        assert_eq!(preempt_action(5, 3, true, true, false), Defer);
        assert_eq!(preempt_action(5, 3, true, false, true), Defer);
        // Before scheduling starts nothing preempts.
        assert_eq!(preempt_action(5, 3, false, false, false), None);
    }

    #[test]
    fn ready_queues_thread_and_marks_it_ready() {
        let _guard = test_lock();
        let tid = insert_thread("readier", 9);
        ready(tid);

        assert_eq!(THREADS.lock().get(tid).unwrap().state, ThreadState::Ready);
        let ccb = cpu::ccb();
        assert!(ccb.rq.lock().contains(9, tid));
        // Clean the shared queue up for other tests.
        assert!(ccb.rq.lock().remove(9, tid));
    }

    #[test]
    fn deferred_preemption_is_latched_while_gate_closed() {
        let _guard = test_lock();
        let ccb = cpu::ccb();
        let tid = insert_thread("latched", 25);

        ACTIVE.store(true, Ordering::Relaxed);
        ccb.cur_prio.store(3, Ordering::Relaxed);
        disable_preempt();
        ready(tid);
        // Gate closed: the request is latched, no switch happened.
        assert!(ccb.preempt_req.load(Ordering::Relaxed));
        ACTIVE.store(false, Ordering::Relaxed);
        // Reopening with ACTIVE off just clears the counter.
        enable_preempt();
        ccb.preempt_req.store(false, Ordering::Relaxed);
        assert!(ccb.rq.lock().remove(25, tid));
    }

    #[test]
    fn quantum_expiry_marks_the_thread_preempted() {
        let _guard = test_lock();
        let ccb = cpu::ccb();
        let runner = insert_thread("runner", 7);
        let peer = insert_thread("peer", 7);

        {
            let mut table = THREADS.lock();
            let t = table.get_mut(runner).unwrap();
            t.state = ThreadState::Running;
            t.quantum_left = 1;
        }
        ccb.cur_thread.store(runner.as_raw(), Ordering::Relaxed);
        ccb.cur_prio.store(7, Ordering::Relaxed);
        ccb.rq.lock().enqueue(7, peer);

        // Keep the gate closed so the expiry latches instead of switching.
        disable_preempt();
        ACTIVE.store(true, Ordering::Relaxed);
        preempt();
        ACTIVE.store(false, Ordering::Relaxed);
        enable_preempt();

        let table = THREADS.lock();
        let t = table.get(runner).unwrap();
        assert_eq!(t.quantum_left, 0);
        assert!(t.preempted);
        assert!(ccb.preempt_req.swap(false, Ordering::Relaxed));
        drop(table);

        ccb.cur_thread.store(cpu::NO_THREAD, Ordering::Relaxed);
        assert!(ccb.rq.lock().remove(7, peer));
    }

    #[test]
    fn lone_thread_gets_a_fresh_quantum_instead_of_preempting() {
        let _guard = test_lock();
        let ccb = cpu::ccb();
        let runner = insert_thread("lone", 6);
        {
            let mut table = THREADS.lock();
            let t = table.get_mut(runner).unwrap();
            t.state = ThreadState::Running;
            t.quantum_left = 1;
        }
        ccb.cur_thread.store(runner.as_raw(), Ordering::Relaxed);
        ccb.cur_prio.store(6, Ordering::Relaxed);

        ACTIVE.store(true, Ordering::Relaxed);
        preempt();
        ACTIVE.store(false, Ordering::Relaxed);

        let table = THREADS.lock();
        let t = table.get(runner).unwrap();
        assert_eq!(t.quantum_left, t.quantum_total);
        assert!(!t.preempted);
        drop(table);
        ccb.cur_thread.store(cpu::NO_THREAD, Ordering::Relaxed);
    }
}
