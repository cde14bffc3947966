//! Memory management: frame allocator, paging ports, the portable walker
//! and its page-table cache, and the kernel heap.
//!
//! Boot order matters here: the frame allocator seeds from the boot
//! record, the heap is mapped through the identity-mapped early path, and
//! only then is the cached kernel address space built (its bookkeeping
//! lives on the heap).

pub mod arch;
pub mod frame_allocator;
pub mod heap;
pub mod mul;
pub mod ptcache;

use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

use arch::{BootScheme, MapFlags, PageScheme};
use frame_allocator::{FRAME_ALLOCATOR, PAGE_SIZE};
use mul::AddressSpace;
use ptcache::SlotWindow;

/// Virtual base of the page-table cache slot window. The boot tables
/// identity-map the first gigabyte with the window region just above it,
/// so the window's own leaf table is reachable by physical address.
const WINDOW_BASE: u64 = 0x4000_0000;

/// The kernel address space behind its walk lock. All map/unmap/change
/// traffic serialises on this mutex.
pub type KernelSpace = AddressSpace<BootScheme, KernelWindow>;

lazy_static! {
    pub static ref KERNEL_SPACE: Mutex<Option<KernelSpace>> = Mutex::new(None);
}

/// Hardware slot window: each slot is one leaf PTE in the kernel's window
/// table, rewritten in place and flushed a single TLB entry at a time.
pub struct KernelWindow {
    entries: *mut Volatile<u64>,
    slots: usize,
}

// The raw entry pointer targets a static kernel table; access is
// serialised by the owning space's walk lock.
unsafe impl Send for KernelWindow {}

impl KernelWindow {
    fn slot_va(slot: usize) -> u64 {
        WINDOW_BASE + slot as u64 * PAGE_SIZE
    }
}

impl SlotWindow for KernelWindow {
    fn slot_count(&self) -> usize {
        self.slots
    }

    unsafe fn bind(&mut self, slot: usize, ptab: u64) -> *mut u8 {
        let va = Self::slot_va(slot);
        (*self.entries.add(slot)).write(BootScheme::encode_leaf(ptab, MapFlags::kernel_rw()));
        self.flush_mapping(va);
        va as *mut u8
    }

    unsafe fn unbind(&mut self, slot: usize) {
        (*self.entries.add(slot)).write(0);
        self.flush_mapping(Self::slot_va(slot));
    }

    fn flush_mapping(&self, vaddr: u64) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr));
    }
}

/// Bring up physical memory, the heap, and the cached kernel space.
pub fn init() {
    let record = crate::bootinfo::record();
    FRAME_ALLOCATOR.lock().init(record);

    let top = {
        let (frame, _) = x86_64::registers::control::Cr3::read();
        frame.start_address().as_u64()
    };

    {
        let mut frames = FRAME_ALLOCATOR.lock();
        heap::init(&mut frames, top);
    }

    let window = unsafe { build_window(top, ptcache::DEFAULT_SLOTS) };
    *KERNEL_SPACE.lock() = Some(AddressSpace::new(top, window));
    crate::log_info!(
        "Kernel space online: {} paging, {} cache slots",
        BootScheme::NAME,
        ptcache::DEFAULT_SLOTS
    );

    // Everything worth keeping from the loader has been copied by now.
    FRAME_ALLOCATOR.lock().donate_reclaim(record);
}

/// Map the window region once through the early path so its leaf table
/// exists, then take a direct pointer to that table's entries.
unsafe fn build_window(top: u64, slots: usize) -> KernelWindow {
    {
        let mut frames = FRAME_ALLOCATOR.lock();
        let scratch = frames
            .alloc_persistent_page()
            .expect("out of memory for the slot window");
        for slot in 0..slots {
            mul::map_early::<BootScheme>(
                &mut *frames,
                top,
                KernelWindow::slot_va(slot),
                scratch,
                MapFlags::kernel_rw(),
            )
            .expect("out of memory for the slot window");
        }
    }

    let leaf = find_leaf_table::<BootScheme>(top, WINDOW_BASE)
        .expect("window leaf table must exist after map_early");
    let first = BootScheme::index(WINDOW_BASE, 1);
    let entries = (leaf + (first * BootScheme::ENTRY_SIZE) as u64) as *mut Volatile<u64>;

    let mut window = KernelWindow { entries, slots };
    // Drop the scratch bindings; slots start out empty.
    for slot in 0..slots {
        window.unbind(slot);
    }
    window
}

/// Identity-mapped walk to the leaf table covering `vaddr`.
fn find_leaf_table<S: PageScheme>(top: u64, vaddr: u64) -> Option<u64> {
    debug_assert_eq!(S::ENTRY_SIZE, 8, "boot walk assumes 64-bit entries");
    let vaddr = S::canonicalize(vaddr);
    let mut table = top;
    for level in (2..=S::LEVELS).rev() {
        let idx = S::index(vaddr, level);
        let raw = unsafe {
            (*(table as *const Volatile<u64>).add(idx)).read()
        };
        if !S::is_present(raw) {
            return None;
        }
        table = S::frame(raw);
    }
    Some(table)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory stand-ins for physical memory, the slot window, and the
    //! frame source.

    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::mul::FrameSource;
    use super::ptcache::SlotWindow;

    #[repr(align(4096))]
    struct Page([u8; 4096]);

    /// Arena of fake physical pages keyed by address.
    pub struct FakePhys {
        pages: RefCell<HashMap<u64, Box<Page>>>,
        next: Cell<u64>,
        /// When set, "physical" addresses are the pages' real heap
        /// addresses, which is exactly the world `map_early` assumes.
        identity: bool,
    }

    impl FakePhys {
        pub fn shared() -> Rc<Self> {
            Rc::new(FakePhys {
                pages: RefCell::new(HashMap::new()),
                next: Cell::new(0x10_0000),
                identity: false,
            })
        }

        pub fn identity() -> Rc<Self> {
            Rc::new(FakePhys {
                pages: RefCell::new(HashMap::new()),
                next: Cell::new(0),
                identity: true,
            })
        }

        /// Allocate a zeroed page-table page, returning its address.
        pub fn fresh_table(&self) -> u64 {
            let page = Box::new(Page([0; 4096]));
            let pa = if self.identity {
                &*page as *const Page as u64
            } else {
                let pa = self.next.get();
                self.next.set(pa + 4096);
                pa
            };
            self.pages.borrow_mut().insert(pa, page);
            pa
        }

        /// Pointer to the backing of `pa`. Boxes pin the storage, so the
        /// pointer survives later arena growth.
        pub fn page_ptr(&self, pa: u64) -> *mut u8 {
            let pages = self.pages.borrow();
            let page = pages.get(&pa).expect("unknown fake physical page");
            page.0.as_ptr() as *mut u8
        }
    }

    impl FrameSource for Rc<FakePhys> {
        fn alloc_table(&mut self) -> Option<u64> {
            Some(self.fresh_table())
        }
    }

    /// Frame source with a fixed budget, for out-of-memory paths.
    pub struct LimitedFrames {
        phys: Rc<FakePhys>,
        budget: usize,
    }

    impl LimitedFrames {
        pub fn new(phys: Rc<FakePhys>, budget: usize) -> Self {
            LimitedFrames { phys, budget }
        }
    }

    impl FrameSource for LimitedFrames {
        fn alloc_table(&mut self) -> Option<u64> {
            if self.budget == 0 {
                return None;
            }
            self.budget -= 1;
            Some(self.phys.fresh_table())
        }
    }

    /// Slot window that resolves bindings straight into the arena.
    pub struct FakeWindow {
        phys: Rc<FakePhys>,
        bound: RefCell<Vec<Option<u64>>>,
        pub flushes: Cell<u64>,
    }

    impl FakeWindow {
        pub fn new(phys: Rc<FakePhys>, slots: usize) -> Self {
            FakeWindow {
                phys,
                bound: RefCell::new(vec![None; slots]),
                flushes: Cell::new(0),
            }
        }
    }

    impl SlotWindow for FakeWindow {
        fn slot_count(&self) -> usize {
            self.bound.borrow().len()
        }

        unsafe fn bind(&mut self, slot: usize, ptab: u64) -> *mut u8 {
            self.bound.borrow_mut()[slot] = Some(ptab);
            self.phys.page_ptr(ptab)
        }

        unsafe fn unbind(&mut self, slot: usize) {
            assert!(self.bound.borrow_mut()[slot].take().is_some());
        }

        fn flush_mapping(&self, _vaddr: u64) {
            self.flushes.set(self.flushes.get() + 1);
        }
    }
}
