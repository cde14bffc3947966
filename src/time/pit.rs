//! 8253/8254 PIT as the platform clock.
//!
//! Channel 0 runs periodically at 1 kHz and the IRQ handler advances the
//! monotonic clock; the "one-shot" the event wheel arms is a software
//! deadline checked on each tick. Good to a millisecond, which is all the
//! wheel promises.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use super::TimerHw;

/// PIT input frequency in Hz.
const PIT_HZ: u64 = 1_193_182;
/// Tick rate programmed into channel 0.
pub const TICK_HZ: u64 = 1000;
/// Nanoseconds per tick.
pub const TICK_NS: u64 = 1_000_000_000 / TICK_HZ;

pub struct PitClock {
    ticks: AtomicU64,
    /// Pending one-shot deadline in ns; 0 means disarmed.
    deadline: AtomicU64,
}

impl PitClock {
    pub const fn new() -> Self {
        PitClock {
            ticks: AtomicU64::new(0),
            deadline: AtomicU64::new(0),
        }
    }

    /// Program channel 0 for periodic interrupts at `TICK_HZ`.
    pub fn start(&self) {
        let divisor = (PIT_HZ / TICK_HZ) as u16;
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut data: Port<u8> = Port::new(0x40);
        unsafe {
            // Channel 0, lobyte/hibyte, mode 3 (square wave).
            cmd.write(0x36);
            data.write(divisor as u8);
            data.write((divisor >> 8) as u8);
        }
        crate::log_info!("PIT timer running at {} Hz", TICK_HZ);
    }

    /// Advance the clock from the timer IRQ. Returns true when the armed
    /// deadline has been reached and the event wheel should run.
    pub fn on_irq(&self) -> bool {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = self.deadline.load(Ordering::Relaxed);
        deadline != 0 && ticks * TICK_NS >= deadline
    }
}

impl TimerHw for PitClock {
    fn now_ns(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed) * TICK_NS
    }

    fn arm_oneshot(&self, deadline_ns: u64) {
        // 0 is the disarmed sentinel; an armed deadline of 0 is already due.
        self.deadline.store(deadline_ns.max(1), Ordering::Relaxed);
    }

    fn disarm(&self) {
        self.deadline.store(0, Ordering::Relaxed);
    }
}
