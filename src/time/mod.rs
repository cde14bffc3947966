//! Time-event wheel: absolute-deadline callbacks driven by the platform
//! timer.
//!
//! Events live on a per-CPU list sorted by deadline; the hardware one-shot
//! is always armed to the head's deadline (or disarmed when the list is
//! empty). `tick` runs every due callback with device interrupts masked, so
//! callbacks must be short; in practice they ready a thread and return.

pub mod pit;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

/// Handle for cancelling an armed event.
pub type EventId = u64;

/// Platform clock and one-shot deadline timer.
///
/// `now_ns` is monotonic; 64-bit nanoseconds do not wrap in this kernel's
/// lifetime. Hardware is the PIT ([`pit::PitClock`]); tests drive a fake.
pub trait TimerHw {
    fn now_ns(&self) -> u64;
    fn arm_oneshot(&self, deadline_ns: u64);
    fn disarm(&self);
}

pub struct TimeEvent {
    pub deadline_ns: u64,
    pub callback: fn(usize),
    pub arg: usize,
    id: EventId,
}

/// Deadline-sorted pending events.
pub struct EventList {
    events: VecDeque<TimeEvent>,
    next_id: EventId,
}

impl EventList {
    pub const fn new() -> Self {
        EventList {
            events: VecDeque::new(),
            next_id: 1,
        }
    }
}

pub struct EventWheel<T: TimerHw> {
    list: Mutex<EventList>,
    hw: T,
}

impl<T: TimerHw> EventWheel<T> {
    pub const fn new(hw: T) -> Self {
        EventWheel {
            list: Mutex::new(EventList::new()),
            hw,
        }
    }

    pub fn hw(&self) -> &T {
        &self.hw
    }

    pub fn now_ns(&self) -> u64 {
        self.hw.now_ns()
    }

    /// Queue `callback(arg)` for `deadline_ns`. Reprograms the one-shot iff
    /// the new event becomes the head.
    pub fn arm(&self, deadline_ns: u64, callback: fn(usize), arg: usize) -> EventId {
        let mut list = self.list.lock();
        let id = list.next_id;
        list.next_id += 1;

        // Insert after any event with an equal deadline so firing order
        // matches arming order.
        let pos = list
            .events
            .iter()
            .position(|ev| ev.deadline_ns > deadline_ns)
            .unwrap_or(list.events.len());
        list.events.insert(
            pos,
            TimeEvent {
                deadline_ns,
                callback,
                arg,
                id,
            },
        );
        if pos == 0 {
            self.hw.arm_oneshot(deadline_ns);
        }
        id
    }

    /// Remove a pending event. Returns false iff the event already fired;
    /// the racing callback owns the cleanup in that case.
    pub fn cancel(&self, id: EventId) -> bool {
        let mut list = self.list.lock();
        let Some(pos) = list.events.iter().position(|ev| ev.id == id) else {
            return false;
        };
        list.events.remove(pos);
        if pos == 0 {
            match list.events.front() {
                Some(head) => self.hw.arm_oneshot(head.deadline_ns),
                None => self.hw.disarm(),
            }
        }
        true
    }

    /// Fire every event whose deadline has passed. Interrupt context; the
    /// list lock is dropped before the callbacks run so they may arm or
    /// cancel events themselves.
    pub fn tick(&self) {
        let now = self.hw.now_ns();
        let due: Vec<TimeEvent> = {
            let mut list = self.list.lock();
            let mut due = Vec::new();
            while list
                .events
                .front()
                .map_or(false, |ev| ev.deadline_ns <= now)
            {
                due.push(list.events.pop_front().unwrap());
            }
            due
        };

        for ev in &due {
            (ev.callback)(ev.arg);
        }

        let list = self.list.lock();
        match list.events.front() {
            Some(head) => self.hw.arm_oneshot(head.deadline_ns),
            None => self.hw.disarm(),
        }
    }

    /// Deadline the hardware should currently be armed for.
    pub fn head_deadline(&self) -> Option<u64> {
        self.list.lock().events.front().map(|ev| ev.deadline_ns)
    }

    pub fn pending(&self) -> usize {
        self.list.lock().events.len()
    }
}

/// Arm an event on the local CPU's wheel.
pub fn arm(deadline_ns: u64, callback: fn(usize), arg: usize) -> EventId {
    crate::cpu::ccb().time.arm(deadline_ns, callback, arg)
}

/// Cancel an event on the local CPU's wheel.
pub fn cancel(id: EventId) -> bool {
    crate::cpu::ccb().time.cancel(id)
}

/// Monotonic nanoseconds since boot.
pub fn now_ns() -> u64 {
    crate::cpu::ccb().time.now_ns()
}


#[cfg(test)]
mod tests {
    use super::testclock::FakeTimer;
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    // Callbacks record through their `arg`, which each test points at its
    // own counter, so parallel test threads cannot interfere.
    fn record(arg: usize) {
        let cell = unsafe { &*(arg as *const AtomicUsize) };
        cell.fetch_add(1, Ordering::SeqCst);
    }

    fn record_last(arg: usize) {
        // Low byte is the tag, the rest is the counter pointer.
        let cell = unsafe { &*((arg & !0xFF) as *const AtomicUsize) };
        cell.store(arg & 0xFF, Ordering::SeqCst);
    }

    fn nop(_arg: usize) {}

    fn wheel() -> EventWheel<FakeTimer> {
        EventWheel::new(FakeTimer::at(0))
    }

    #[test]
    fn hardware_tracks_the_head_deadline() {
        let wheel = wheel();
        assert_eq!(wheel.hw().armed.get(), None);

        wheel.arm(500, nop, 0);
        assert_eq!(wheel.hw().armed.get(), Some(500));

        // An earlier deadline takes over the one-shot...
        let early = wheel.arm(200, nop, 0);
        assert_eq!(wheel.hw().armed.get(), Some(200));
        // ...a later one does not.
        wheel.arm(900, nop, 0);
        assert_eq!(wheel.hw().armed.get(), Some(200));

        // Cancelling the head reprograms to the new head.
        assert!(wheel.cancel(early));
        assert_eq!(wheel.hw().armed.get(), Some(500));
        assert_eq!(wheel.head_deadline(), Some(500));
    }

    #[test]
    fn tick_fires_everything_due_and_rearms() {
        let fired = alloc::boxed::Box::new(AtomicUsize::new(0));
        let arg = &*fired as *const AtomicUsize as usize;

        let wheel = wheel();
        wheel.arm(300, record, arg);
        wheel.arm(100, record, arg);
        wheel.arm(200, record, arg);

        wheel.hw().now.set(250);
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        // The survivor re-armed the one-shot.
        assert_eq!(wheel.hw().armed.get(), Some(300));

        wheel.hw().now.set(300);
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(wheel.hw().armed.get(), None);
        assert_eq!(wheel.head_deadline(), None);
    }

    #[test]
    fn cancel_after_fire_reports_the_race() {
        let wheel = wheel();
        let id = wheel.arm(100, nop, 0);
        wheel.hw().now.set(150);
        wheel.tick();
        // The callback already ran; the canceller must treat the timer as
        // the winner.
        assert!(!wheel.cancel(id));
    }

    #[test]
    fn equal_deadlines_fire_in_arming_order() {
        // 256-aligned so the low tag bits stay clear.
        let last = alloc::boxed::Box::new(Aligned(AtomicUsize::new(0)));
        let base = &last.0 as *const AtomicUsize as usize;
        assert_eq!(base & 0xFF, 0);

        let wheel = wheel();
        wheel.arm(100, record_last, base | 7);
        wheel.arm(100, record_last, base | 8);
        wheel.hw().now.set(100);
        wheel.tick();
        assert_eq!(last.0.load(Ordering::SeqCst), 8);
    }

    #[repr(align(256))]
    struct Aligned(AtomicUsize);
}
