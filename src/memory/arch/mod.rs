//! Per-architecture paging ports.
//!
//! Every port describes one radix page-table format through the
//! [`PageScheme`] trait: how many levels it has, how a virtual address is
//! chopped into table indices, and how entries are encoded. The portable
//! walker in `memory::mul` is written once against this trait; the ports
//! below only translate bits.
//!
//! Level numbering is uniform across ports: level 1 is the leaf level
//! (entries reference data frames), level `LEVELS` is the top table the
//! address-space root points at.

pub mod armv8;
pub mod riscv;
pub mod x86;
pub mod x86_64;

pub use self::x86_64::X86Long;

/// The paging scheme the running kernel actually programs into hardware.
#[cfg(target_arch = "x86_64")]
pub type BootScheme = X86Long;

bitflags::bitflags! {
    /// Arch-neutral mapping rights and attributes.
    ///
    /// Ports translate these onto their PTE bits; a bit the format cannot
    /// express (e.g. no-execute on pre-PAE x86) is silently dropped.
    /// Kernel-only and no-execute are not separate bits: absence of `USER`
    /// means a kernel mapping, and absence of `EXEC` makes ports with an
    /// NX/XN bit encode the entry no-execute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXEC          = 1 << 2;
        const USER          = 1 << 3;
        const GLOBAL        = 1 << 4;
        const NO_CACHE      = 1 << 5;
        const WRITE_THROUGH = 1 << 6;
    }
}

impl MapFlags {
    /// Shorthand for kernel read/write data mappings.
    pub const fn kernel_rw() -> Self {
        Self::READ.union(Self::WRITE)
    }
}

/// One radix page-table format.
pub trait PageScheme {
    /// Number of levels; 2 (two-level x86) up to 4 (long mode, ARMv8).
    const LEVELS: u8;
    /// Size of one table entry in bytes (4 on two-level x86, 8 elsewhere).
    const ENTRY_SIZE: usize;
    /// Name shown in the boot log.
    const NAME: &'static str;
    /// Flags this format can actually express (used by the flag tests).
    const SUPPORTED: MapFlags;

    /// Table index selected by `vaddr` at `level`.
    fn index(vaddr: u64, level: u8) -> usize;

    /// Mask / sign-extend `vaddr` into the hardware's canonical form.
    fn canonicalize(vaddr: u64) -> u64;

    /// Encode an interior entry referencing the table page at `ptab`.
    ///
    /// `level` is the level of the table the entry lives in (so the
    /// referenced table sits at `level - 1`). Some formats encode interior
    /// entries differently per level (the PAE PDPT reserves the RW/US
    /// bits).
    fn encode_table(ptab: u64, flags: MapFlags, level: u8) -> u64;

    /// Encode a leaf entry referencing the data frame at `frame`.
    fn encode_leaf(frame: u64, flags: MapFlags) -> u64;

    /// Present/valid test, any level.
    fn is_present(raw: u64) -> bool;

    /// Physical frame referenced by a present entry.
    fn frame(raw: u64) -> u64;

    /// Arch-neutral view of a present leaf entry.
    fn decode_leaf(raw: u64) -> MapFlags;
}

/// Sign-extend `vaddr` from `bits` wide to 64 bits.
///
/// Both long-mode x86 and ARMv8/RISC-V require the unused high bits to
/// replicate the top implemented bit.
pub(crate) fn sign_extend(vaddr: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    (((vaddr << shift) as i64) >> shift) as u64
}
