//! 32-bit x86 table formats: the classic two-level layout and PAE.
//!
//! Neither is wired to hardware in this build; they exist so the portable
//! walker covers every format the bootloader can hand off from, and they
//! carry the bit-exact encodings the 64-bit port extends.

use bit_field::BitField;

use super::{MapFlags, PageScheme};

pub(super) const PG_PRESENT: u64 = 1 << 0;
pub(super) const PG_RW: u64 = 1 << 1;
pub(super) const PG_USER: u64 = 1 << 2;
const PG_WT: u64 = 1 << 3;
const PG_CD: u64 = 1 << 4;
const PG_GLOBAL: u64 = 1 << 8;
pub(super) const PG_NX: u64 = 1 << 63;

/// Frame field of a legacy 32-bit entry, bits 12..31.
const FRAME_MASK_32: u64 = 0xFFFF_F000;
/// Frame field of a PAE/long-mode entry, bits 12..51.
pub(super) const FRAME_MASK_64: u64 = 0x000F_FFFF_FFFF_F000;

pub(super) fn encode_common(flags: MapFlags) -> u64 {
    let mut raw = PG_PRESENT;
    if flags.contains(MapFlags::WRITE) {
        raw |= PG_RW;
    }
    if flags.contains(MapFlags::USER) {
        raw |= PG_USER;
    }
    if flags.contains(MapFlags::GLOBAL) {
        raw |= PG_GLOBAL;
    }
    if flags.contains(MapFlags::WRITE_THROUGH) {
        raw |= PG_WT;
    }
    if flags.contains(MapFlags::NO_CACHE) {
        raw |= PG_CD;
    }
    raw
}

pub(super) fn decode_common(raw: u64) -> MapFlags {
    let mut flags = MapFlags::READ;
    if raw & PG_RW != 0 {
        flags |= MapFlags::WRITE;
    }
    if raw & PG_USER != 0 {
        flags |= MapFlags::USER;
    }
    if raw & PG_GLOBAL != 0 {
        flags |= MapFlags::GLOBAL;
    }
    if raw & PG_WT != 0 {
        flags |= MapFlags::WRITE_THROUGH;
    }
    if raw & PG_CD != 0 {
        flags |= MapFlags::NO_CACHE;
    }
    flags
}

/// Two-level non-PAE paging: 1024-entry tables of 32-bit words.
pub struct X86Legacy;

impl PageScheme for X86Legacy {
    const LEVELS: u8 = 2;
    const ENTRY_SIZE: usize = 4;
    const NAME: &'static str = "x86 2-level";
    const SUPPORTED: MapFlags = MapFlags::READ
        .union(MapFlags::WRITE)
        .union(MapFlags::USER)
        .union(MapFlags::GLOBAL)
        .union(MapFlags::NO_CACHE)
        .union(MapFlags::WRITE_THROUGH);

    fn index(vaddr: u64, level: u8) -> usize {
        match level {
            1 => vaddr.get_bits(12..22) as usize,
            2 => vaddr.get_bits(22..32) as usize,
            _ => unreachable!("level out of range"),
        }
    }

    fn canonicalize(vaddr: u64) -> u64 {
        vaddr & 0xFFFF_FFFF
    }

    fn encode_table(ptab: u64, flags: MapFlags, _level: u8) -> u64 {
        // Interior entries stay permissive; the leaf is the authority.
        let user = if flags.contains(MapFlags::USER) { PG_USER } else { 0 };
        (ptab & FRAME_MASK_32) | PG_PRESENT | PG_RW | user
    }

    fn encode_leaf(frame: u64, flags: MapFlags) -> u64 {
        // No NX here: EXEC cannot be withheld on this format.
        (frame & FRAME_MASK_32) | encode_common(flags)
    }

    fn is_present(raw: u64) -> bool {
        raw & PG_PRESENT != 0
    }

    fn frame(raw: u64) -> u64 {
        raw & FRAME_MASK_32
    }

    fn decode_leaf(raw: u64) -> MapFlags {
        decode_common(raw) | MapFlags::EXEC
    }
}

/// PAE paging: a 4-entry directory-pointer table over 512-entry tables of
/// 64-bit words, with the NX bit at 63.
pub struct X86Pae;

impl PageScheme for X86Pae {
    const LEVELS: u8 = 3;
    const ENTRY_SIZE: usize = 8;
    const NAME: &'static str = "x86 PAE";
    const SUPPORTED: MapFlags = MapFlags::all();

    fn index(vaddr: u64, level: u8) -> usize {
        match level {
            1 => vaddr.get_bits(12..21) as usize,
            2 => vaddr.get_bits(21..30) as usize,
            3 => vaddr.get_bits(30..32) as usize,
            _ => unreachable!("level out of range"),
        }
    }

    fn canonicalize(vaddr: u64) -> u64 {
        vaddr & 0xFFFF_FFFF
    }

    fn encode_table(ptab: u64, flags: MapFlags, level: u8) -> u64 {
        if level == 3 {
            // PDPT entries reserve the RW/US bits; present only.
            (ptab & FRAME_MASK_64) | PG_PRESENT
        } else {
            let user = if flags.contains(MapFlags::USER) { PG_USER } else { 0 };
            (ptab & FRAME_MASK_64) | PG_PRESENT | PG_RW | user
        }
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
