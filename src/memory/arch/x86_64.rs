//! Long-mode paging: four 512-entry levels with the PAE bit layout.
//!
//! This is the port the kernel programs into hardware on x86_64.

use bit_field::BitField;

use super::x86::{decode_common, encode_common, FRAME_MASK_64, PG_NX, PG_PRESENT, PG_RW, PG_USER};
use super::{sign_extend, MapFlags, PageScheme};

pub struct X86Long;

impl PageScheme for X86Long {
    const LEVELS: u8 = 4;
    const ENTRY_SIZE: usize = 8;
    const NAME: &'static str = "x86_64 long mode";
    const SUPPORTED: MapFlags = MapFlags::all();

    fn index(vaddr: u64, level: u8) -> usize {
        debug_assert!((1..=4).contains(&level));
        let low = 12 + 9 * (level as usize - 1);
        vaddr.get_bits(low..low + 9) as usize
    }

    fn canonicalize(vaddr: u64) -> u64 {
        // Bits 63..48 must replicate bit 47.
        sign_extend(vaddr, 48)
    }

    fn encode_table(ptab: u64, flags: MapFlags, _level: u8) -> u64 {
        let user = if flags.contains(MapFlags::USER) { PG_USER } else { 0 };
        (ptab & FRAME_MASK_64) | PG_PRESENT | PG_RW | user
    }

    fn encode_leaf(frame: u64, flags: MapFlags) -> u64 {
        let mut raw = (frame & FRAME_MASK_64) | encode_common(flags);
        if !flags.contains(MapFlags::EXEC) {
            raw |= PG_NX;
        }
        raw
    }

    fn is_present(raw: u64) -> bool {
        raw & PG_PRESENT != 0
    }

    fn frame(raw: u64) -> u64 {
        raw & FRAME_MASK_64
    }

    fn decode_leaf(raw: u64) -> MapFlags {
        let mut flags = decode_common(raw);
        if raw & PG_NX == 0 {
            flags |= MapFlags::EXEC;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_shifts_are_9_bits_from_12() {
        let va = 0xFFFF_8042_1395_A000u64;
        assert_eq!(X86Long::index(va, 4), (va >> 39) as usize & 0x1FF);
        assert_eq!(X86Long::index(va, 3), (va >> 30) as usize & 0x1FF);
        assert_eq!(X86Long::index(va, 2), (va >> 21) as usize & 0x1FF);
        assert_eq!(X86Long::index(va, 1), (va >> 12) as usize & 0x1FF);
    }

    #[test]
    fn canonical_addresses_are_fixed_points() {
        for va in [0u64, 0x7FFF_FFFF_F000, 0xFFFF_8000_0000_0000, 0xFFFF_FFFF_FFFF_F000] {
            assert_eq!(X86Long::canonicalize(va), va);
        }
        // A non-canonical upper-half address gets its high bits rewritten.
        assert_eq!(
            X86Long::canonicalize(0x0000_9000_0000_0000),
            0xFFFF_9000_0000_0000
        );
    }

    #[test]
    fn flag_round_trip_is_lossless() {
        for bits in 0..0x80u32 {
            let flags = MapFlags::from_bits_truncate(bits) | MapFlags::READ;
            let back = X86Long::decode_leaf(X86Long::encode_leaf(0xABCD_E000, flags));
            assert!(back.contains(flags));
        }
    }

    #[test]
    fn frame_field_spans_bits_12_to_51() {
        let raw = X86Long::encode_leaf(0x000F_FFFF_FFFF_F000, MapFlags::kernel_rw());
        assert_eq!(X86Long::frame(raw), 0x000F_FFFF_FFFF_F000);
    }
}
