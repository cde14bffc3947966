//! Kernel heap, mapped through the early bootstrap path before the cached
//! walker (which itself needs heap-backed bookkeeping) comes up.

use linked_list_allocator::LockedHeap;

use super::arch::{BootScheme, MapFlags};
use super::frame_allocator::{FrameAllocator, PAGE_SIZE};
use super::mul;

#[cfg_attr(not(test), global_allocator)]
#[cfg_attr(test, allow(dead_code))]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Heap window, directly above the page-table cache slots.
pub const HEAP_BASE: u64 = 0x4010_0000;
pub const HEAP_SIZE: u64 = 512 * 1024;

/// Map and publish the heap. Runs with paging live but the allocator not
/// yet usable, so every mapping goes through `map_early` on the
/// identity-mapped boot tables.
pub fn init(frames: &mut FrameAllocator, top: u64) {
    let mut mapped = 0;
    while mapped < HEAP_SIZE {
        let frame = frames.alloc_page().expect("out of memory sizing the kernel heap");
        unsafe {
            mul::map_early::<BootScheme>(
                frames,
                top,
                HEAP_BASE + mapped,
                frame,
                MapFlags::kernel_rw(),
            )
            .expect("out of memory mapping the kernel heap");
        }
        mapped += PAGE_SIZE;
    }
    unsafe {
        ALLOCATOR.lock().init(HEAP_BASE as *mut u8, HEAP_SIZE as usize);
    }
    crate::log_info!("Kernel heap: {} KiB at {:#x}", HEAP_SIZE / 1024, HEAP_BASE);
}
