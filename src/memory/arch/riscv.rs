//! RISC-V SvXX page tables.
//!
//! Sv39 and Sv48 share one entry format (V/R/W/X/U/G/A/D in the low byte,
//! the PPN from bit 10) and differ only in level count and the width of
//! the sign-extended virtual address. Mode selection (probing the largest
//! `satp.MODE` that sticks) is M-mode firmware work and happens before the
//! kernel sees the tables; both ports are built and the boot path picks one.

use bit_field::BitField;

use super::{sign_extend, MapFlags, PageScheme};

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_G: u64 = 1 << 5;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

const SUPPORTED: MapFlags = MapFlags::READ
    .union(MapFlags::WRITE)
    .union(MapFlags::EXEC)
    .union(MapFlags::USER)
    .union(MapFlags::GLOBAL);

fn index(vaddr: u64, level: u8) -> usize {
    let low = 12 + 9 * (level as usize - 1);
    vaddr.get_bits(low..low + 9) as usize
}

fn encode_table(ptab: u64) -> u64 {
    // An entry with V set and R/W/X clear is a pointer to the next level.
    ((ptab >> 12) << 10) | PTE_V
}

fn encode_leaf(frame: u64, flags: MapFlags) -> u64 {
    // A and D are pre-set so first touch doesn't fault on cores that trap
    // instead of updating them.
    let mut raw = ((frame >> 12) << 10) | PTE_V | PTE_R | PTE_A | PTE_D;
    if flags.contains(MapFlags::WRITE) {
        raw |= PTE_W;
    }
    if flags.contains(MapFlags::EXEC) {
        raw |= PTE_X;
    }
    if flags.contains(MapFlags::USER) {
        raw |= PTE_U;
    }
    if flags.contains(MapFlags::GLOBAL) {
        raw |= PTE_G;
    }
    raw
}

fn frame(raw: u64) -> u64 {
    (raw >> 10) << 12
}

fn decode_leaf(raw: u64) -> MapFlags {
    let mut flags = MapFlags::empty();
    if raw & PTE_R != 0 {
        flags |= MapFlags::READ;
    }
    if raw & PTE_W != 0 {
        flags |= MapFlags::WRITE;
    }
    if raw & PTE_X != 0 {
        flags |= MapFlags::EXEC;
    }
    if raw & PTE_U != 0 {
        flags |= MapFlags::USER;
    }
    if raw & PTE_G != 0 {
        flags |= MapFlags::GLOBAL;
    }
    flags
}

macro_rules! sv_scheme {
    ($name:ident, $levels:expr, $vabits:expr, $label:expr) => {
        pub struct $name;

        impl PageScheme for $name {
            const LEVELS: u8 = $levels;
            const ENTRY_SIZE: usize = 8;
            const NAME: &'static str = $label;
            const SUPPORTED: MapFlags = SUPPORTED;

            fn index(vaddr: u64, level: u8) -> usize {
                debug_assert!((1..=$levels).contains(&level));
                index(vaddr, level)
            }

            fn canonicalize(vaddr: u64) -> u64 {
                sign_extend(vaddr, $vabits)
            }

            fn encode_table(ptab: u64, _flags: MapFlags, _level: u8) -> u64 {
                encode_table(ptab)
            }

            fn encode_leaf(frame: u64, flags: MapFlags) -> u64 {
                encode_leaf(frame, flags)
            }

            fn is_present(raw: u64) -> bool {
                raw & PTE_V != 0
            }

            fn frame(raw: u64) -> u64 {
                frame(raw)
            }

            fn decode_leaf(raw: u64) -> MapFlags {
                decode_leaf(raw)
            }
        }
    };
}

sv_scheme!(Sv39, 3, 39, "RISC-V Sv39");
sv_scheme!(Sv48, 4, 48, "RISC-V Sv48");
