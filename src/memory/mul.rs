//! Memory unit layer: the portable page-table walker.
//!
//! One walker serves every radix format the kernel knows about; the
//! format-specific pieces (level count, index shifts, entry encodings,
//! canonical form) come from a [`PageScheme`] port and the physical tables
//! are reached through the page-table cache. Table pages for missing
//! interior levels are pulled from a [`FrameSource`] as the walk descends.
//!
//! All operations on one address space must run under that space's walk
//! lock (the spin mutex wrapping the space in its owner). Queries may skip
//! the lock only when the caller can rule out concurrent writers.

use core::fmt;
use core::marker::PhantomData;

use volatile::Volatile;

use super::arch::{MapFlags, PageScheme};
use super::ptcache::{PtCache, SlotId, SlotWindow};

/// Supplies zero-filled pages for new page-table levels.
pub trait FrameSource {
    fn alloc_table(&mut self) -> Option<u64>;
}

/// Mapping failure. The only failure a walk can surface is frame
/// exhaustion; interior entries written before the failure stay in place
/// and are reused by the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "out of physical memory for page tables"),
        }
    }
}

/// Decoded view of a present leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: u64,
    pub flags: MapFlags,
    pub raw: u64,
}

/// One address space: a top-level table plus the cache used to reach the
/// levels below it.
pub struct AddressSpace<S: PageScheme, W: SlotWindow> {
    top: u64,
    cache: PtCache<W>,
    /// Set whenever a mapping changed; platforms with lazy TLB maintenance
    /// check and clear this at the next context switch.
    tlb_update_pending: bool,
    /// Bumped on every structural change, for debugging stale-walk bugs.
    generation: u64,
    _scheme: PhantomData<S>,
}

impl<S: PageScheme, W: SlotWindow> AddressSpace<S, W> {
    /// Wrap the (zeroed) top-level table at physical `top`.
    pub fn new(top: u64, window: W) -> Self {
        assert_eq!(top & 0xFFF, 0, "top-level table must be page-aligned");
        AddressSpace {
            top,
            cache: PtCache::new(window),
            tlb_update_pending: false,
            generation: 0,
            _scheme: PhantomData,
        }
    }

    pub fn top(&self) -> u64 {
        self.top
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tlb_update_pending(&self) -> bool {
        self.tlb_update_pending
    }

    pub fn clear_tlb_pending(&mut self) {
        self.tlb_update_pending = false;
    }

    pub fn cache_stats(&self) -> super::ptcache::PtcStats {
        self.cache.stats()
    }

    /// Map `vaddr -> paddr` with `flags`, allocating interior tables as
    /// needed. Remapping an already-mapped address rewrites the leaf.
    pub fn map(
        &mut self,
        frames: &mut dyn FrameSource,
        vaddr: u64,
        paddr: u64,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let vaddr = S::canonicalize(vaddr);
        let mut slot = self.borrow(self.top, S::LEVELS);

        for level in (2..=S::LEVELS).rev() {
            let idx = S::index(vaddr, level);
            let table = self.cache.table_ptr(slot);
            let raw = unsafe { read_entry::<S>(table, idx) };
            let next = if S::is_present(raw) {
                S::frame(raw)
            } else {
                let frame = match frames.alloc_table() {
                    Some(frame) => frame,
                    None => {
                        // Entries already written stay; a retry reuses them.
                        self.cache.release(slot);
                        return Err(MapError::OutOfMemory);
                    }
                };
                unsafe { write_entry::<S>(table, idx, S::encode_table(frame, flags, level)) };
                self.generation += 1;
                frame
            };
            slot = self.step(slot, next, level - 1);
        }

        let idx = S::index(vaddr, 1);
        let table = self.cache.table_ptr(slot);
        unsafe { write_entry::<S>(table, idx, S::encode_leaf(paddr, flags)) };
        self.cache.release(slot);
        self.cache.flush_mapping(vaddr);
        self.generation += 1;
        self.tlb_update_pending = true;
        Ok(())
    }

    /// Remove the leaf mapping for `vaddr`. Missing mappings (including
    /// missing interior levels) are a no-op; the tables themselves are not
    /// reclaimed.
    pub fn unmap(&mut self, vaddr: u64) {
        let vaddr = S::canonicalize(vaddr);
        let Some((slot, idx)) = self.walk_leaf(vaddr) else {
            return;
        };
        let table = self.cache.table_ptr(slot);
        unsafe { write_entry::<S>(table, idx, 0) };
        self.cache.release(slot);
        self.cache.flush_mapping(vaddr);
        self.generation += 1;
        self.tlb_update_pending = true;
    }

    /// Rewrite the rights of an existing mapping; absent mappings are a
    /// no-op.
    pub fn change(&mut self, vaddr: u64, flags: MapFlags) {
        let vaddr = S::canonicalize(vaddr);
        let Some((slot, idx)) = self.walk_leaf(vaddr) else {
            return;
        };
        let table = self.cache.table_ptr(slot);
        let raw = unsafe { read_entry::<S>(table, idx) };
        if S::is_present(raw) {
            unsafe { write_entry::<S>(table, idx, S::encode_leaf(S::frame(raw), flags)) };
            self.cache.flush_mapping(vaddr);
            self.generation += 1;
            self.tlb_update_pending = true;
        }
        self.cache.release(slot);
    }

    /// Look up the leaf entry for `vaddr`.
    pub fn get(&mut self, vaddr: u64) -> Option<Mapping> {
        let vaddr = S::canonicalize(vaddr);
        let (slot, idx) = self.walk_leaf(vaddr)?;
        let table = self.cache.table_ptr(slot);
        let raw = unsafe { read_entry::<S>(table, idx) };
        self.cache.release(slot);
        if S::is_present(raw) {
            Some(Mapping {
                frame: S::frame(raw),
                flags: S::decode_leaf(raw),
                raw,
            })
        } else {
            None
        }
    }

    /// Tear down the cache bindings (the tables themselves belong to the
    /// frame allocator's caller).
    pub fn retire(&mut self) {
        self.cache.drain();
    }

    /// Walk to the leaf table without allocating; `None` when an interior
    /// level is absent.
    fn walk_leaf(&mut self, vaddr: u64) -> Option<(SlotId, usize)> {
        let mut slot = self.borrow(self.top, S::LEVELS);
        for level in (2..=S::LEVELS).rev() {
            let idx = S::index(vaddr, level);
            let table = self.cache.table_ptr(slot);
            let raw = unsafe { read_entry::<S>(table, idx) };
            if !S::is_present(raw) {
                self.cache.release(slot);
                return None;
            }
            slot = self.step(slot, S::frame(raw), level - 1);
        }
        Some((slot, S::index(vaddr, 1)))
    }

    fn borrow(&mut self, ptab: u64, level: u8) -> SlotId {
        // The walker holds one slot at a time, so exhaustion here means a
        // leak, not pressure; eviction already absorbed any transient case.
        self.cache
            .get(ptab, level)
            .expect("page-table cache exhausted mid-walk")
    }

    fn step(&mut self, slot: SlotId, ptab: u64, level: u8) -> SlotId {
        self.cache
            .swap(slot, ptab, level)
            .expect("page-table cache exhausted mid-walk")
    }
}

/// Bootstrap mapper for the window before any cache exists: the tables are
/// reached through the identity mapping the boot path still runs under.
///
/// # Safety
/// Every table page reachable from `top` must be identity-mapped, and the
/// caller must be the only one touching the tables.
pub unsafe fn map_early<S: PageScheme>(
    frames: &mut dyn FrameSource,
    top: u64,
    vaddr: u64,
    paddr: u64,
    flags: MapFlags,
) -> Result<(), MapError> {
    let vaddr = S::canonicalize(vaddr);
    let mut table = top as *mut u8;

    for level in (2..=S::LEVELS).rev() {
        let idx = S::index(vaddr, level);
        let raw = read_entry::<S>(table, idx);
        let next = if S::is_present(raw) {
            S::frame(raw)
        } else {
            let frame = frames.alloc_table().ok_or(MapError::OutOfMemory)?;
            write_entry::<S>(table, idx, S::encode_table(frame, flags, level));
            frame
        };
        table = next as *mut u8;
    }

    write_entry::<S>(table, S::index(vaddr, 1), S::encode_leaf(paddr, flags));
    Ok(())
}

unsafe fn read_entry<S: PageScheme>(table: *mut u8, idx: usize) -> u64 {
    if S::ENTRY_SIZE == 4 {
        (*(table as *const Volatile<u32>).add(idx)).read() as u64
    } else {
        (*(table as *const Volatile<u64>).add(idx)).read()
    }
}

unsafe fn write_entry<S: PageScheme>(table: *mut u8, idx: usize, raw: u64) {
    if S::ENTRY_SIZE == 4 {
        (*(table as *mut Volatile<u32>).add(idx)).write(raw as u32)
    } else {
        (*(table as *mut Volatile<u64>).add(idx)).write(raw)
    }
}
