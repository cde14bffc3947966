//! Per-CPU control block and the interrupt priority level gate.
//!
//! Everything per-CPU lives in the [`Ccb`] and is reached through [`ccb`],
//! the single accessor. This build runs one CPU; the layout is already
//! SMP-shaped (per-CPU block, spinlocks on every shared field) so bringing
//! up more CPUs means indexing the accessor by a CPU-special register, not
//! restructuring.
//!
//! The IPL gate orders interrupt delivery: hardware interrupts at or below
//! the current level are masked. `IPL_LOW` masks nothing, `IPL_HIGH`
//! masks every device interrupt. Between a `raise_ipl`/`lower_ipl` pair
//! the level is monotonic non-decreasing.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::scheduler::RunQueues;
use crate::time::pit::PitClock;
use crate::time::EventWheel;

pub type Ipl = u8;

/// No device interrupts masked.
pub const IPL_LOW: Ipl = 0;
/// Device interrupts masked, clock still delivered.
pub const IPL_DEVICE: Ipl = 1;
/// Clock masked as well; only the mask registers, not RFLAGS.IF.
pub const IPL_CLOCK: Ipl = 2;
/// Everything masked via the interrupt flag.
pub const IPL_HIGH: Ipl = 3;

/// Sentinel for "no thread" in the current/idle fields.
pub const NO_THREAD: u32 = u32::MAX;

/// Per-CPU control block.
pub struct Ccb {
    /// Current interrupt priority level.
    pub cur_ipl: AtomicU8,
    /// Nesting depth of hardware interrupt handlers on this CPU.
    pub int_active: AtomicU32,
    /// Preemption gate; non-zero defers preemption.
    pub preempt_disable: AtomicU32,
    /// A deferred preemption is waiting for the gate to open.
    pub preempt_req: AtomicBool,
    /// Raw id of the running thread (`NO_THREAD` before scheduling starts).
    pub cur_thread: AtomicU32,
    /// Priority of the running thread, cached for wakeup decisions.
    pub cur_prio: AtomicU8,
    /// Raw id of this CPU's idle thread.
    pub idle_thread: AtomicU32,
    /// Ready queues, one per priority.
    pub rq: Mutex<RunQueues>,
    /// Time-event wheel driven by the platform clock.
    pub time: EventWheel<PitClock>,
}

impl Ccb {
    fn new() -> Self {
        Ccb {
            // Boot runs fully masked until the kernel opens the gate.
            cur_ipl: AtomicU8::new(IPL_HIGH),
            int_active: AtomicU32::new(0),
            preempt_disable: AtomicU32::new(0),
            preempt_req: AtomicBool::new(false),
            cur_thread: AtomicU32::new(NO_THREAD),
            cur_prio: AtomicU8::new(0),
            idle_thread: AtomicU32::new(NO_THREAD),
            rq: Mutex::new(RunQueues::new()),
            time: EventWheel::new(PitClock::new()),
        }
    }
}

lazy_static! {
    static ref CCB0: Ccb = Ccb::new();
}

/// The local CPU's control block.
pub fn ccb() -> &'static Ccb {
    &CCB0
}

/// Raise the IPL to `new`, returning the previous level for the matching
/// [`lower_ipl`]. Raising to a lower level than current is a bug.
pub fn raise_ipl(new: Ipl) -> Ipl {
    let ccb = ccb();
    let old = ccb.cur_ipl.load(Ordering::Relaxed);
    debug_assert!(new >= old, "IPL lowered through raise_ipl ({} -> {})", old, new);
    if new != old {
        ccb.cur_ipl.store(new, Ordering::Relaxed);
        apply_ipl(new);
    }
    old
}

/// Restore the IPL returned by the matching [`raise_ipl`].
pub fn lower_ipl(old: Ipl) {
    let ccb = ccb();
    debug_assert!(old <= ccb.cur_ipl.load(Ordering::Relaxed));
    ccb.cur_ipl.store(old, Ordering::Relaxed);
    apply_ipl(old);
}

pub fn current_ipl() -> Ipl {
    ccb().cur_ipl.load(Ordering::Relaxed)
}

/// Hardware-interrupt prologue bookkeeping.
pub fn interrupt_enter() {
    ccb().int_active.fetch_add(1, Ordering::Relaxed);
}

/// Hardware-interrupt epilogue bookkeeping.
pub fn interrupt_exit() {
    let prev = ccb().int_active.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "interrupt_exit without enter");
}

pub fn in_interrupt() -> bool {
    ccb().int_active.load(Ordering::Relaxed) > 0
}

/// Program the hardware for `ipl`.
///
/// Interrupts are re-enabled only outside handler context; a handler's
/// IRET restores the flag itself.
fn apply_ipl(ipl: Ipl) {
    #[cfg(not(test))]
    {
        use x86_64::instructions::interrupts;

        if ipl >= IPL_HIGH {
            interrupts::disable();
            return;
        }
        let (primary, secondary) = match ipl {
            // IPL_LOW masks nothing, by contract.
            IPL_LOW => (crate::interrupts::IRQ_MASK_NONE, crate::interrupts::IRQ_MASK_NONE),
            IPL_DEVICE => (crate::interrupts::IRQ_MASK_OPEN, 0xFF),
            _ => (0xFF, 0xFF),
        };
        crate::interrupts::set_irq_masks(primary, secondary);
        if !in_interrupt() {
            interrupts::enable();
        }
    }
    #[cfg(test)]
    let _ = ipl;
}
