//! Boot hand-off record.
//!
//! The loader leaves a multiboot2 structure in memory; this module distils
//! it into the kernel's own fixed-layout record so nothing past early boot
//! ever touches loader-specific structures. The record carries the memory
//! map, loaded modules, the early allocation pool, the display descriptor
//! and the firmware-table addresses the loader discovered.

use multiboot2::{BootInformation, BootInformationHeader, FramebufferType, MemoryAreaType};
use spin::Once;

use crate::log_warn;

pub const MAX_MEM_ENTRIES: usize = 64;
pub const MAX_MODULES: usize = 16;
pub const MAX_FW_TABLES: usize = 32;
/// Size of the early memory pool reserved out of the first usable region.
pub const EARLY_POOL_SIZE: u64 = 128 * 1024;

const NAME_LEN: usize = 64;
const CMDLINE_LEN: usize = 128;

/// What kind of firmware loaded us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Firmware {
    Bios,
    Efi,
}

/// Ownership/usability class of one physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemKind {
    Free,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
    Mmio,
    FwReclaim,
    /// Loader working memory; usable once the kernel has copied what it
    /// needs out of it.
    BootReclaim,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        const NON_VOLATILE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemEntry {
    pub base: u64,
    pub size: u64,
    pub kind: MemKind,
    pub flags: MemFlags,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ModuleEntry {
    pub start: u64,
    pub end: u64,
    name: [u8; NAME_LEN],
}

impl ModuleEntry {
    pub fn name(&self) -> &str {
        str_field(&self.name)
    }
}

/// Linear-framebuffer description, valid when `present` is set.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DisplayInfo {
    pub present: bool,
    pub width: u32,
    pub height: u32,
    pub bytes_per_line: u32,
    pub bpp: u8,
    pub bytes_per_px: u8,
    pub lfb_size: u64,
    pub red_mask: u8,
    pub red_shift: u8,
    pub green_mask: u8,
    pub green_shift: u8,
    pub blue_mask: u8,
    pub blue_shift: u8,
    pub resvd_mask: u8,
    pub resvd_shift: u8,
    pub framebuffer: u64,
}

/// Firmware tables the loader located for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FwTable {
    Acpi = 0,
    Mps = 1,
    Pnp = 2,
    Apm = 3,
    Smbios = 4,
    Smbios3 = 5,
    Pci = 6,
    Vesa = 7,
    Bios32 = 8,
}

/// The fixed-layout hand-off record everything downstream consumes.
#[repr(C)]
pub struct BootRecord {
    pub firmware: Firmware,
    sys_name: [u8; NAME_LEN],
    cmdline: [u8; CMDLINE_LEN],
    mem: [MemEntry; MAX_MEM_ENTRIES],
    mem_count: usize,
    modules: [ModuleEntry; MAX_MODULES],
    module_count: usize,
    /// Early allocation pool carved from the first usable range.
    pub early_pool_base: u64,
    pub early_pool_size: u64,
    pub display: DisplayInfo,
    tables_detected: u32,
    table_addrs: [u64; MAX_FW_TABLES],
}

impl BootRecord {
    pub fn sys_name(&self) -> &str {
        str_field(&self.sys_name)
    }

    pub fn cmdline(&self) -> &str {
        str_field(&self.cmdline)
    }

    pub fn memory(&self) -> &[MemEntry] {
        &self.mem[..self.mem_count]
    }

    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules[..self.module_count]
    }

    pub fn detected(&self, table: FwTable) -> bool {
        self.tables_detected & (1 << table as u32) != 0
    }

    pub fn table_addr(&self, table: FwTable) -> u64 {
        self.table_addrs[table as usize]
    }

    fn mark_table(&mut self, table: FwTable, addr: u64) {
        self.tables_detected |= 1 << table as u32;
        self.table_addrs[table as usize] = addr;
    }

    fn push_mem(&mut self, entry: MemEntry) {
        if self.mem_count < MAX_MEM_ENTRIES {
            self.mem[self.mem_count] = entry;
            self.mem_count += 1;
        } else {
            log_warn!("Boot memory map overflow, dropping {:#x}+{:#x}", entry.base, entry.size);
        }
    }

    const fn empty() -> Self {
        const NO_MEM: MemEntry = MemEntry {
            base: 0,
            size: 0,
            kind: MemKind::Reserved,
            flags: MemFlags::empty(),
        };
        const NO_MOD: ModuleEntry = ModuleEntry {
            start: 0,
            end: 0,
            name: [0; NAME_LEN],
        };
        BootRecord {
            firmware: Firmware::Bios,
            sys_name: [0; NAME_LEN],
            cmdline: [0; CMDLINE_LEN],
            mem: [NO_MEM; MAX_MEM_ENTRIES],
            mem_count: 0,
            modules: [NO_MOD; MAX_MODULES],
            module_count: 0,
            early_pool_base: 0,
            early_pool_size: 0,
            display: DisplayInfo {
                present: false,
                width: 0,
                height: 0,
                bytes_per_line: 0,
                bpp: 0,
                bytes_per_px: 0,
                lfb_size: 0,
                red_mask: 0,
                red_shift: 0,
                green_mask: 0,
                green_shift: 0,
                blue_mask: 0,
                blue_shift: 0,
                resvd_mask: 0,
                resvd_shift: 0,
                framebuffer: 0,
            },
            tables_detected: 0,
            table_addrs: [0; MAX_FW_TABLES],
        }
    }
}

static RECORD: Once<BootRecord> = Once::new();

/// The hand-off record; valid after `init`.
pub fn record() -> &'static BootRecord {
    RECORD.get().expect("boot record used before bootinfo::init")
}

/// Parse the multiboot2 structure at `mb_addr` into the hand-off record.
pub fn init(mb_addr: usize) {
    let info = unsafe { BootInformation::load(mb_addr as *const BootInformationHeader) }
        .expect("Failed to load Multiboot2 info");

    RECORD.call_once(|| build_record(&info));

    let record = record();
    crate::log_info!(
        "Boot record: {} memory entries, {} modules, firmware {:?}",
        record.memory().len(),
        record.modules().len(),
        record.firmware
    );
}

fn build_record(info: &BootInformation) -> BootRecord {
    let mut record = BootRecord::empty();

    record.firmware = if info.efi_sdt64_tag().is_some() || info.efi_sdt32_tag().is_some() {
        Firmware::Efi
    } else {
        Firmware::Bios
    };

    if let Some(tag) = info.boot_loader_name_tag() {
        if let Ok(name) = tag.name() {
            copy_str(&mut record.sys_name, name);
        }
    }
    if let Some(tag) = info.command_line_tag() {
        if let Ok(line) = tag.cmdline() {
            copy_str(&mut record.cmdline, line);
        }
    }

    if let Some(map) = info.memory_map_tag() {
        for area in map.memory_areas() {
            let kind = classify_area(MemoryAreaType::from(area.typ()));
            record.push_mem(MemEntry {
                base: area.start_address(),
                size: area.size(),
                kind,
                flags: MemFlags::empty(),
            });
        }
    }

    // The loader's own structures become reclaimable once we are done
    // copying; mark the multiboot region so.
    record.push_mem(MemEntry {
        base: info.start_address() as u64 & !0xFFF,
        size: ((info.total_size() as u64) + 0xFFF) & !0xFFF,
        kind: MemKind::BootReclaim,
        flags: MemFlags::empty(),
    });

    for module in info.module_tags() {
        if record.module_count == MAX_MODULES {
            log_warn!("Too many boot modules, dropping the rest");
            break;
        }
        let mut entry = ModuleEntry {
            start: module.start_address() as u64,
            end: module.end_address() as u64,
            name: [0; NAME_LEN],
        };
        if let Ok(name) = module.cmdline() {
            copy_str(&mut entry.name, name);
        }
        record.modules[record.module_count] = entry;
        record.module_count += 1;
    }

    carve_early_pool(&mut record);

    if let Some(Ok(fb)) = info.framebuffer_tag() {
        record.display = display_from_fb(
            fb.address(),
            fb.width(),
            fb.height(),
            fb.pitch(),
            fb.bpp(),
            fb.buffer_type().ok(),
        );
    }

    if let Some(rsdp) = info.rsdp_v2_tag() {
        record.mark_table(FwTable::Acpi, rsdp.xsdt_address() as u64);
    } else if let Some(rsdp) = info.rsdp_v1_tag() {
        record.mark_table(FwTable::Acpi, rsdp.rsdt_address() as u64);
    }
    if info.smbios_tag().is_some() {
        record.mark_table(FwTable::Smbios, 0);
    }
    if info.vbe_info_tag().is_some() {
        record.mark_table(FwTable::Vesa, 0);
    }

    record
}

/// Reserve the 128 KiB early pool at the head of the first large-enough
/// free range above 1 MiB. The pool is bump-only and never returns pages;
/// the range behind it stays in the free map.
fn carve_early_pool(record: &mut BootRecord) {
    for i in 0..record.mem_count {
        let entry = record.mem[i];
        if entry.kind != MemKind::Free || entry.base < 0x10_0000 {
            continue;
        }
        if entry.size < EARLY_POOL_SIZE {
            continue;
        }
        record.early_pool_base = (entry.base + 0xFFF) & !0xFFF;
        record.early_pool_size = EARLY_POOL_SIZE;
        record.mem[i].base = record.early_pool_base + EARLY_POOL_SIZE;
        record.mem[i].size = entry.size - (record.mem[i].base - entry.base);
        return;
    }
    panic!("no usable range for the early memory pool");
}

/// Map a loader memory class onto ours. Anything we don't positively know
/// to be usable stays reserved.
fn classify_area(area: MemoryAreaType) -> MemKind {
    match area {
        MemoryAreaType::Available => MemKind::Free,
        MemoryAreaType::AcpiAvailable => MemKind::AcpiReclaim,
        MemoryAreaType::ReservedHibernate => MemKind::AcpiNvs,
        _ => MemKind::Reserved,
    }
}

fn display_from_fb(
    address: u64,
    width: u32,
    height: u32,
    pitch: u32,
    bpp: u8,
    ty: Option<FramebufferType>,
) -> DisplayInfo {
    let mut display = DisplayInfo {
        present: true,
        width,
        height,
        bytes_per_line: pitch,
        bpp,
        bytes_per_px: (bpp as u32).div_ceil(8) as u8,
        lfb_size: pitch as u64 * height as u64,
        framebuffer: address,
        ..Default::default()
    };
    if let Some(FramebufferType::RGB { red, green, blue }) = ty {
        display.red_mask = red.size;
        display.red_shift = red.position;
        display.green_mask = green.size;
        display.green_shift = green.position;
        display.blue_mask = blue.size;
        display.blue_shift = blue.position;
    }
    display
}

fn copy_str(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn str_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_memory_classes_map_onto_ours() {
        assert_eq!(classify_area(MemoryAreaType::Available), MemKind::Free);
        assert_eq!(classify_area(MemoryAreaType::AcpiAvailable), MemKind::AcpiReclaim);
        assert_eq!(classify_area(MemoryAreaType::ReservedHibernate), MemKind::AcpiNvs);
        assert_eq!(classify_area(MemoryAreaType::Reserved), MemKind::Reserved);
        assert_eq!(classify_area(MemoryAreaType::Custom(20)), MemKind::Reserved);
    }

    #[test]
    fn early_pool_comes_out_of_the_first_free_range() {
        let mut record = BootRecord::empty();
        record.push_mem(MemEntry {
            base: 0x0,
            size: 0x9F000,
            kind: MemKind::Free,
            flags: MemFlags::empty(),
        });
        record.push_mem(MemEntry {
            base: 0x10_0000,
            size: 0x100_0000,
            kind: MemKind::Free,
            flags: MemFlags::empty(),
        });
        carve_early_pool(&mut record);

        assert_eq!(record.early_pool_base, 0x10_0000);
        assert_eq!(record.early_pool_size, EARLY_POOL_SIZE);
        // The free range shrank by exactly the pool.
        assert_eq!(record.memory()[1].base, 0x10_0000 + EARLY_POOL_SIZE);
        // The low range was skipped: the pool never sits under 1 MiB.
        assert_eq!(record.memory()[0].base, 0);
    }

    #[test]
    fn table_bitmap_and_addresses_pair_up() {
        let mut record = BootRecord::empty();
        assert!(!record.detected(FwTable::Acpi));
        record.mark_table(FwTable::Acpi, 0xE0000);
        record.mark_table(FwTable::Smbios3, 0xF0000);
        assert!(record.detected(FwTable::Acpi));
        assert!(record.detected(FwTable::Smbios3));
        assert!(!record.detected(FwTable::Pci));
        assert_eq!(record.table_addr(FwTable::Acpi), 0xE0000);
        assert_eq!(record.table_addr(FwTable::Smbios3), 0xF0000);
    }

    #[test]
    fn string_fields_are_nul_bounded() {
        let mut record = BootRecord::empty();
        copy_str(&mut record.cmdline, "console=serial loglevel=7");
        assert_eq!(record.cmdline(), "console=serial loglevel=7");
        assert_eq!(record.sys_name(), "");
    }

    #[test]
    fn display_descriptor_fills_derived_fields() {
        let display = display_from_fb(0xFD00_0000, 1024, 768, 4096, 32, None);
        assert_eq!(display.bytes_per_px, 4);
        assert_eq!(display.lfb_size, 4096 * 768);
        assert!(display.present);
    }
}
