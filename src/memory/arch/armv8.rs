//! ARMv8 (AArch64) 48-bit translation tables, 4 KiB granule.
//!
//! Four 512-entry levels. Interior entries are table descriptors
//! (bits 1:0 = 0b11); leaves are level-3 page descriptors, which also
//! carry 0b11 with permissions in the upper attribute fields. See the
//! ARM ARM, stage-1 VMSAv8-64 descriptor formats.

use bit_field::BitField;

use super::{sign_extend, MapFlags, PageScheme};

const DESC_VALID: u64 = 1 << 0;
/// Distinguishes table/page descriptors from block descriptors.
const DESC_TABLE: u64 = 1 << 1;
/// AttrIndx, index into MAIR_EL1. Index 0 = normal WB, 1 = device.
const ATTR_DEVICE: u64 = 1 << 2;
/// Access permission: EL0 reachable.
const AP_EL0: u64 = 1 << 6;
/// Access permission: read-only.
const AP_RO: u64 = 1 << 7;
/// Inner shareable.
const SH_INNER: u64 = 0b11 << 8;
/// Access flag; without it the first access faults.
const DESC_AF: u64 = 1 << 10;
/// Not-global: the entry is tagged with the current ASID.
const DESC_NG: u64 = 1 << 11;
const DESC_PXN: u64 = 1 << 53;
const DESC_UXN: u64 = 1 << 54;

/// Output address field, bits 12..47.
const FRAME_MASK: u64 = 0x0000_FFFF_FFFF_F000;

pub struct Armv8;

impl PageScheme for Armv8 {
    const LEVELS: u8 = 4;
    const ENTRY_SIZE: usize = 8;
    const NAME: &'static str = "ARMv8 48-bit";
    const SUPPORTED: MapFlags = MapFlags::READ
        .union(MapFlags::WRITE)
        .union(MapFlags::EXEC)
        .union(MapFlags::USER)
        .union(MapFlags::GLOBAL)
        .union(MapFlags::NO_CACHE);

    fn index(vaddr: u64, level: u8) -> usize {
        debug_assert!((1..=4).contains(&level));
        let low = 12 + 9 * (level as usize - 1);
        vaddr.get_bits(low..low + 9) as usize
    }

    fn canonicalize(vaddr: u64) -> u64 {
        // TTBR1 addresses replicate bit 47 upward, same shape as x86_64.
        sign_extend(vaddr, 48)
    }

    fn encode_table(ptab: u64, _flags: MapFlags, _level: u8) -> u64 {
        (ptab & FRAME_MASK) | DESC_VALID | DESC_TABLE
    }

    fn encode_leaf(frame: u64, flags: MapFlags) -> u64 {
        let mut raw = (frame & FRAME_MASK) | DESC_VALID | DESC_TABLE | DESC_AF | SH_INNER;
        if !flags.contains(MapFlags::WRITE) {
            raw |= AP_RO;
        }
        if flags.contains(MapFlags::USER) {
            raw |= AP_EL0;
        }
        if !flags.contains(MapFlags::GLOBAL) {
            raw |= DESC_NG;
        }
        if flags.contains(MapFlags::NO_CACHE) {
            raw |= ATTR_DEVICE;
        }
        if !flags.contains(MapFlags::EXEC) {
            raw |= DESC_PXN | DESC_UXN;
        }
        raw
    }

    fn is_present(raw: u64) -> bool {
        raw & DESC_VALID != 0
    }

    fn frame(raw: u64) -> u64 {
        raw & FRAME_MASK
    }

    fn decode_leaf(raw: u64) -> MapFlags {
        let mut flags = MapFlags::READ;
        if raw & AP_RO == 0 {
            flags |= MapFlags::WRITE;
        }
        if raw & AP_EL0 != 0 {
            flags |= MapFlags::USER;
        }
        if raw & DESC_NG == 0 {
            flags |= MapFlags::GLOBAL;
        }
        if raw & ATTR_DEVICE != 0 {
            flags |= MapFlags::NO_CACHE;
        }
        if raw & DESC_UXN == 0 {
            flags |= MapFlags::EXEC;
        }
        flags
    }
}
