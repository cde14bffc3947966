use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use bit_field::BitField;

use super::context::CpuContext;
use crate::sync::WaitObj;

/// Number of fixed priority levels. Higher number = more important;
/// priority 0 is reserved for the idle thread.
pub const PRIO_LEVELS: usize = 32;

/// Priority given to threads that don't ask for one.
pub const PRIO_DEFAULT: u8 = 16;

/// Timer ticks a thread may run before equal-priority peers get a turn.
pub const QUANTUM_TICKS: u32 = 10;

/// Kernel stack size for spawned threads (16 KiB).
pub const STACK_SIZE: usize = 4096 * 4;

/// Thread handle: arena index in the low half, slot generation in the high
/// half so a stale handle can never reach a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    pub fn new(index: usize, generation: u16) -> Self {
        let mut raw = 0u32;
        raw.set_bits(0..16, index as u32);
        raw.set_bits(16..32, generation as u32);
        ThreadId(raw)
    }

    pub fn index(self) -> usize {
        self.0.get_bits(0..16) as usize
    }

    pub fn generation(self) -> u16 {
        self.0.get_bits(16..32) as u16
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        ThreadId(raw)
    }
}

/// Thread lifecycle. `Terminated` is terminal; a TCB is only dropped from
/// the arena in that state, never while any queue still references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Waiting,
    Terminated,
}

/// A kernel thread's control block.
pub struct Thread {
    pub tid: ThreadId,
    pub name: String,
    pub priority: u8,
    pub state: ThreadState,
    pub quantum_total: u32,
    pub quantum_left: u32,
    pub context: CpuContext,
    pub entry: fn(usize),
    pub arg: usize,
    /// Clock reading when this thread was last dispatched.
    pub last_schedule_ns: u64,
    /// Accumulated CPU time.
    pub run_time_ns: u64,
    /// Set when the thread lost the CPU involuntarily.
    pub preempted: bool,
    /// Per-wait bookkeeping, live for the duration of one blocking call.
    pub wait: WaitObj,
    /// Owned kernel stack, kept alive as long as the thread exists.
    _stack: Box<[u8]>,
}

impl Thread {
    pub fn new(name: &str, priority: u8, entry: fn(usize), arg: usize, stack: Box<[u8]>) -> Self {
        assert!((priority as usize) < PRIO_LEVELS);
        let context = if stack.is_empty() {
            // Bootstrap thread: its context is captured by the first switch.
            CpuContext::empty()
        } else {
            let top = stack.as_ptr() as u64 + stack.len() as u64;
            CpuContext::fresh(super::thread_startup as usize as u64, top)
        };
        Thread {
            tid: ThreadId::new(0, 0),
            name: String::from(name),
            priority,
            state: ThreadState::Created,
            quantum_total: QUANTUM_TICKS,
            quantum_left: QUANTUM_TICKS,
            context,
            entry,
            arg,
            last_schedule_ns: 0,
            run_time_ns: 0,
            preempted: false,
            wait: WaitObj::new(),
            _stack: stack,
        }
    }
}

/// Arena of live TCBs.
///
/// Each thread is boxed so its address stays stable across slot churn:
/// the scheduler extracts raw context pointers under the lock and uses
/// them after releasing it, which inline storage would invalidate.
pub struct ThreadTable {
    slots: Vec<Option<Box<Thread>>>,
    generations: Vec<u16>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        ThreadTable {
            slots: Vec::new(),
            generations: Vec::new(),
        }
    }

    /// Add a thread, assigning its id.
    pub fn insert(&mut self, mut thread: Thread) -> ThreadId {
        let index = match self.slots.iter().position(|slot| slot.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        let tid = ThreadId::new(index, self.generations[index]);
        thread.tid = tid;
        self.slots[index] = Some(Box::new(thread));
        tid
    }

    pub fn get(&self, tid: ThreadId) -> Option<&Thread> {
        self.slots
            .get(tid.index())?
            .as_deref()
            .filter(|t| t.tid == tid)
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.slots
            .get_mut(tid.index())?
            .as_deref_mut()
            .filter(|t| t.tid == tid)
    }

    /// Drop a terminated thread and retire its handle generation.
    pub fn remove(&mut self, tid: ThreadId) -> Option<Box<Thread>> {
        let slot = self.slots.get_mut(tid.index())?;
        if slot.as_deref().map(|t| t.tid) != Some(tid) {
            return None;
        }
        let thread = slot.take().unwrap();
        assert_eq!(
            thread.state,
            ThreadState::Terminated,
            "removing a live thread"
        );
        self.generations[tid.index()] = self.generations[tid.index()].wrapping_add(1);
        Some(thread)
    }

    /// Ids of every thread currently in `Terminated` state.
    pub fn terminated(&self) -> Vec<ThreadId> {
        self.slots
            .iter()
            .flatten()
            .filter(|t| t.state == ThreadState::Terminated)
            .map(|t| t.tid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn noop(_: usize) {}

    fn thread(name: &str, priority: u8) -> Thread {
        Thread::new(name, priority, noop, 0, vec![0u8; 128].into_boxed_slice())
    }

    #[test]
    fn ids_pack_index_and_generation() {
        let tid = ThreadId::new(42, 7);
        assert_eq!(tid.index(), 42);
        assert_eq!(tid.generation(), 7);
        assert_eq!(ThreadId::from_raw(tid.as_raw()), tid);
    }

    #[test]
    fn slots_are_reused_with_a_fresh_generation() {
        let mut table = ThreadTable::new();
        let a = table.insert(thread("a", 4));
        table.get_mut(a).unwrap().state = ThreadState::Terminated;
        table.remove(a).unwrap();

        let b = table.insert(thread("b", 4));
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        // The stale handle must not resolve to the new occupant.
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn remove_requires_terminal_state() {
        let mut table = ThreadTable::new();
        let a = table.insert(thread("a", 4));
        table.get_mut(a).unwrap().state = ThreadState::Terminated;
        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
    }

    #[test]
    fn terminated_lists_only_dead_threads() {
        let mut table = ThreadTable::new();
        let a = table.insert(thread("a", 4));
        let b = table.insert(thread("b", 4));
        table.get_mut(b).unwrap().state = ThreadState::Terminated;
        let dead = table.terminated();
        assert_eq!(dead, vec![b]);
        assert!(table.get(a).is_some());
    }
}
