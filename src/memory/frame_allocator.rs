//! Physical frame allocator.
//!
//! Early boot runs a bump cursor over the `Free` ranges of the boot
//! record; pages handed back later go on an intrusive free list threaded
//! through the pages themselves. Every allocation returns a zero-filled
//! page. The pool is capped at the identity-mapped first gigabyte because
//! both zeroing and the free list dereference frames by their physical
//! address.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::bootinfo::{BootRecord, MemKind};

pub const PAGE_SIZE: u64 = 4096;

/// Frames above this are left to a future high-memory pool.
const IDENTITY_LIMIT: u64 = 1 << 30;

/// Bump pools never hand out the real-mode megabyte.
const LOW_LIMIT: u64 = 0x10_0000;

const MAX_REGIONS: usize = crate::bootinfo::MAX_MEM_ENTRIES;

/// Cursor over usable physical ranges. Pure bookkeeping; it never touches
/// the memory it hands out, so it is directly testable.
pub struct BumpRegions {
    regions: [(u64, u64); MAX_REGIONS],
    count: usize,
    cursor: usize,
    next: u64,
}

impl BumpRegions {
    pub const fn empty() -> Self {
        BumpRegions {
            regions: [(0, 0); MAX_REGIONS],
            count: 0,
            cursor: 0,
            next: 0,
        }
    }

    /// Register a usable range, trimmed inward to page boundaries and
    /// clipped to the identity-mapped window.
    pub fn add(&mut self, base: u64, size: u64) {
        let start = base.max(LOW_LIMIT);
        let end = (base + size).min(IDENTITY_LIMIT);
        let start = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = end & !(PAGE_SIZE - 1);
        if start >= end || self.count == MAX_REGIONS {
            return;
        }
        self.regions[self.count] = (start, end - start);
        self.count += 1;
        if self.count == 1 {
            self.next = start;
        }
    }

    /// Carve `pages` contiguous frames, advancing across regions.
    pub fn take(&mut self, pages: u64) -> Option<u64> {
        let want = pages * PAGE_SIZE;
        while self.cursor < self.count {
            let (base, size) = self.regions[self.cursor];
            if self.next < base {
                self.next = base;
            }
            if self.next + want <= base + size {
                let frame = self.next;
                self.next += want;
                return Some(frame);
            }
            self.cursor += 1;
        }
        None
    }

    /// Total pages still available to the cursor.
    pub fn remaining_pages(&self) -> u64 {
        let mut total = 0;
        for i in self.cursor..self.count {
            let (base, size) = self.regions[i];
            let from = if i == self.cursor { self.next.max(base) } else { base };
            total += (base + size).saturating_sub(from) / PAGE_SIZE;
        }
        total
    }
}

pub struct FrameAllocator {
    bump: BumpRegions,
    /// Head of the intrusive free list (physical address), 0 when empty.
    free_head: u64,
    free_count: u64,
    /// Pages handed out with no free path (boot-lifetime structures).
    persistent: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        FrameAllocator {
            bump: BumpRegions::empty(),
            free_head: 0,
            free_count: 0,
            persistent: 0,
        }
    }

    /// Seed the pool from the boot record's free ranges. The early pool
    /// was already carved out of the record by `bootinfo`.
    pub fn init(&mut self, record: &BootRecord) {
        for entry in record.memory() {
            if entry.kind == MemKind::Free {
                self.bump.add(entry.base, entry.size);
            }
        }
        crate::log_info!(
            "Frame allocator: {} pages usable",
            self.bump.remaining_pages()
        );
    }

    /// Hand loader working memory to the pool once the kernel is done
    /// copying out of it.
    pub fn donate_reclaim(&mut self, record: &BootRecord) {
        for entry in record.memory() {
            if entry.kind == MemKind::BootReclaim {
                self.bump.add(entry.base, entry.size);
            }
        }
    }

    /// One zero-filled page, or `None` when physical memory is exhausted.
    pub fn alloc_page(&mut self) -> Option<u64> {
        let frame = match self.pop_free() {
            Some(frame) => frame,
            None => self.bump.take(1)?,
        };
        unsafe { zero_page(frame) };
        Some(frame)
    }

    /// `n` contiguous zero-filled pages. Served from the bump cursor only;
    /// the free list makes no contiguity promises.
    pub fn alloc_pages(&mut self, n: u64) -> Option<u64> {
        let frame = self.bump.take(n)?;
        for i in 0..n {
            unsafe { zero_page(frame + i * PAGE_SIZE) };
        }
        Some(frame)
    }

    /// A page that will never be freed (boot-lifetime structures).
    pub fn alloc_persistent_page(&mut self) -> Option<u64> {
        let frame = self.alloc_page()?;
        self.persistent += 1;
        Some(frame)
    }

    /// Return a page to the pool.
    pub fn free_page(&mut self, frame: u64) {
        debug_assert_eq!(frame % PAGE_SIZE, 0);
        unsafe {
            (frame as *mut u64).write_volatile(self.free_head);
        }
        self.free_head = frame;
        self.free_count += 1;
    }

    pub fn free_pages_count(&self) -> u64 {
        self.free_count + self.bump.remaining_pages()
    }

    fn pop_free(&mut self) -> Option<u64> {
        if self.free_head == 0 {
            return None;
        }
        let frame = self.free_head;
        self.free_head = unsafe { (frame as *const u64).read_volatile() };
        self.free_count -= 1;
        Some(frame)
    }
}

impl crate::memory::mul::FrameSource for FrameAllocator {
    fn alloc_table(&mut self) -> Option<u64> {
        self.alloc_page()
    }
}

unsafe fn zero_page(frame: u64) {
    core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE as usize);
}

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
}
