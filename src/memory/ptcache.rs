//! Page-table cache: a bounded pool of kernel virtual slots used to reach
//! arbitrary physical page-table pages without identity-mapping all of RAM.
//!
//! Each slot is backed by one leaf PTE in a well-known kernel table; binding
//! a slot rewrites that PTE and invalidates the slot's TLB entry. The pool
//! keeps recently used bindings alive so repeated walks over the same tables
//! rebind nothing: a released slot stays on its level's used list until the
//! pool runs dry and it is evicted.
//!
//! Eviction is two-class: level-1 slots (leaf-walk scratch) go first, LRU
//! within the list; slots caching level ≥ 2 tables alias larger working sets
//! and survive longer. A slot that is currently borrowed (`in_use`) is never
//! evicted.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

/// Deepest format the cache must serve (long mode / ARMv8).
pub const MAX_LEVELS: usize = 4;

/// Default number of window slots a space's cache is built with.
pub const DEFAULT_SLOTS: usize = 16;

/// Handle to a borrowed slot; index into the pool.
pub type SlotId = usize;

/// How slots reach physical table pages.
///
/// The hardware window writes a leaf PTE in the kernel's slot table and
/// issues a single-entry TLB invalidate; tests substitute an in-memory
/// arena. `bind` returns the pointer through which the table page is
/// accessed for as long as the binding lasts.
pub trait SlotWindow {
    /// Number of slots the window exposes.
    fn slot_count(&self) -> usize;

    /// Point `slot` at the table page at physical `ptab`.
    ///
    /// # Safety
    /// `ptab` must reference a live page-table page. The returned pointer is
    /// invalidated by the next `bind`/`unbind` of the same slot.
    unsafe fn bind(&mut self, slot: usize, ptab: u64) -> *mut u8;

    /// Clear `slot`'s mapping and invalidate its TLB entry.
    ///
    /// # Safety
    /// No caller may still hold the pointer returned by `bind`.
    unsafe fn unbind(&mut self, slot: usize);

    /// Single-entry TLB invalidate for a mapping the walker just changed.
    fn flush_mapping(&self, vaddr: u64);
}

/// Slot acquisition failure: every slot is simultaneously borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSlots;

impl fmt::Display for OutOfSlots {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "all page-table cache slots are borrowed")
    }
}

/// Hit/miss/eviction counters, reported at boot and checked by tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtcStats {
    pub hits: u64,
    pub misses: u64,
    /// Evictions indexed by the evicted slot's level - 1.
    pub evictions: [u64; MAX_LEVELS],
}

struct Slot {
    phys: u64,
    level: u8,
    ptr: *mut u8,
    bound: bool,
    in_use: bool,
}

pub struct PtCache<W: SlotWindow> {
    window: W,
    slots: Vec<Slot>,
    /// Unbound slots; most recently returned at the back, taken from the back.
    free: VecDeque<SlotId>,
    /// Bound slots per level (index = level - 1); LRU at the front.
    used: [VecDeque<SlotId>; MAX_LEVELS],
    stats: PtcStats,
}

// Raw slot pointers are only dereferenced by the borrower, which holds the
// owning space's walk lock.
unsafe impl<W: SlotWindow + Send> Send for PtCache<W> {}

impl<W: SlotWindow> PtCache<W> {
    pub fn new(window: W) -> Self {
        let count = window.slot_count();
        assert!(count >= 4, "page-table cache needs at least 4 slots");
        let mut slots = Vec::with_capacity(count);
        let mut free = VecDeque::with_capacity(count);
        for id in 0..count {
            slots.push(Slot {
                phys: 0,
                level: 0,
                ptr: core::ptr::null_mut(),
                bound: false,
                in_use: false,
            });
            free.push_back(id);
        }
        PtCache {
            window,
            slots,
            free,
            used: Default::default(),
            stats: PtcStats::default(),
        }
    }

    /// Borrow a slot mapping the table page at `ptab` (a `level`-level
    /// table). Cache hit if some slot already maps `ptab`; otherwise a free
    /// slot is bound, evicting the coldest cached binding when none is free.
    pub fn get(&mut self, ptab: u64, level: u8) -> Result<SlotId, OutOfSlots> {
        debug_assert!(ptab & 0xFFF == 0, "table pages are page-aligned");
        debug_assert!((1..=MAX_LEVELS as u8).contains(&level));

        if let Some(id) = self.lookup(ptab) {
            let slot = &mut self.slots[id];
            debug_assert!(!slot.in_use, "table borrowed twice under one walk lock");
            debug_assert_eq!(slot.level, level);
            slot.in_use = true;
            self.touch(id, level);
            self.stats.hits += 1;
            return Ok(id);
        }

        self.stats.misses += 1;
        let id = match self.free.pop_back() {
            Some(id) => id,
            None => self.evict()?,
        };

        let ptr = unsafe { self.window.bind(id, ptab) };
        let slot = &mut self.slots[id];
        slot.phys = ptab;
        slot.level = level;
        slot.ptr = ptr;
        slot.bound = true;
        slot.in_use = true;
        self.used[level as usize - 1].push_back(id);
        Ok(id)
    }

    /// End a borrow. The binding stays cached on its used list until evicted.
    pub fn release(&mut self, id: SlotId) {
        let slot = &mut self.slots[id];
        debug_assert!(slot.in_use);
        slot.in_use = false;
    }

    /// Equivalent to `release(slot)` followed by `get(ptab, level)`; the
    /// walker uses this to step from a table to its child.
    pub fn swap(&mut self, id: SlotId, ptab: u64, level: u8) -> Result<SlotId, OutOfSlots> {
        self.release(id);
        self.get(ptab, level)
    }

    /// Pointer through which the borrowed table page is accessed.
    pub fn table_ptr(&self, id: SlotId) -> *mut u8 {
        debug_assert!(self.slots[id].in_use);
        self.slots[id].ptr
    }

    /// Single-entry TLB invalidate, forwarded to the window.
    pub fn flush_mapping(&self, vaddr: u64) {
        self.window.flush_mapping(vaddr);
    }

    /// Drop every cached binding. Used at space teardown; panics if a slot
    /// is still borrowed.
    pub fn drain(&mut self) {
        for level in 0..MAX_LEVELS {
            while let Some(id) = self.used[level].pop_front() {
                assert!(!self.slots[id].in_use, "draining a borrowed slot");
                unsafe { self.window.unbind(id) };
                self.slots[id].bound = false;
                self.free.push_back(id);
            }
        }
    }

    pub fn stats(&self) -> PtcStats {
        self.stats
    }

    fn lookup(&self, ptab: u64) -> Option<SlotId> {
        // Pools are small (≤ 32); a linear scan beats any index.
        self.slots
            .iter()
            .position(|s| s.bound && s.phys == ptab)
    }

    /// Move a cached slot to the warm end of its list.
    fn touch(&mut self, id: SlotId, level: u8) {
        let list = &mut self.used[level as usize - 1];
        if let Some(pos) = list.iter().position(|&x| x == id) {
            list.remove(pos);
            list.push_back(id);
        }
    }

    /// Reclaim the coldest unborrowed slot, preferring level-1 bindings.
    fn evict(&mut self) -> Result<SlotId, OutOfSlots> {
        for level in 0..MAX_LEVELS {
            let slots = &self.slots;
            let pos = self.used[level].iter().position(|&id| !slots[id].in_use);
            if let Some(pos) = pos {
                let id = self.used[level].remove(pos).unwrap();
                unsafe { self.window.unbind(id) };
                self.slots[id].bound = false;
                self.stats.evictions[level] += 1;
                return Ok(id);
            }
        }
        Err(OutOfSlots)
    }

    /// Slot-count conservation check used by the tests.
    #[cfg(test)]
    fn resident(&self) -> usize {
        self.free.len() + self.used.iter().map(|l| l.len()).sum::<usize>()
    }
}
