//! MMU Support
//!
//! Page-table entry encoding and MMU control for ARM64 with 4 KiB pages
//! and 4-level, 48-bit translation.

use crate::cpu::{dsb_sy, isb};
use aarch64_cpu::registers::*;
#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Number of entries per translation table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Physical address mask for page table entries.
pub const PHYS_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// TCR_EL1 field values: 48-bit VA, 4 KiB granule, inner-shareable,
/// write-back write-allocate, 40-bit IPA.
mod tcr_config {
    /// T0SZ = 16: 48-bit virtual addresses through TTBR0.
    pub const T0SZ: u64 = 16;
    /// IPS = 0b010: 40-bit intermediate physical addresses.
    pub const IPS_40BIT: u64 = 0b010 << 32;
    /// SH0 = 0b11: inner shareable.
    pub const SH0_INNER: u64 = 0b11 << 12;
    /// ORGN0 = 0b01: outer write-back write-allocate.
    pub const ORGN0_WBWA: u64 = 0b01 << 10;
    /// IRGN0 = 0b01: inner write-back write-allocate.
    pub const IRGN0_WBWA: u64 = 0b01 << 8;
}

/// Page-table entry flags.
///
/// Any valid leaf must carry [`flags::AF`]; the hardware raises an
/// access fault otherwise. Leaves mapping device MMIO must carry
/// [`flags::ATTR_DEVICE`] plus both execute-never bits.
pub mod flags {
    /// Entry is valid.
    pub const VALID: u64 = 1 << 0;
    /// Table descriptor (levels 0-2).
    pub const TABLE: u64 = 1 << 1;
    /// Page descriptor (level 3).
    pub const PAGE: u64 = 1 << 1;
    /// Access flag; must be set on every valid leaf.
    pub const AF: u64 = 1 << 10;
    /// Inner shareable.
    pub const SH_INNER: u64 = 3 << 8;
    /// Read-only at the permitted level.
    pub const AP_RO: u64 = 1 << 7;
    /// Accessible from EL0.
    pub const AP_EL0: u64 = 1 << 6;
    /// Unprivileged execute never.
    pub const UXN: u64 = 1 << 54;
    /// Privileged execute never.
    pub const PXN: u64 = 1 << 53;

    /// MAIR index 0: normal write-back memory.
    pub const ATTR_NORMAL: u64 = 0 << 2;
    /// MAIR index 1: device nGnRE memory.
    pub const ATTR_DEVICE: u64 = 1 << 2;

    /// Kernel RAM: RW at EL1, never executable from EL0. The kernel
    /// image lives inside this mapping, so no PXN.
    pub const KERNEL: u64 = VALID | PAGE | AF | SH_INNER | ATTR_NORMAL | UXN;
    /// Device MMIO: RW at EL1, no execution from anywhere.
    pub const DEVICE: u64 = VALID | PAGE | AF | ATTR_DEVICE | UXN | PXN;
    /// User code: RX at EL0, never executable at EL1.
    pub const USER_CODE: u64 = VALID | PAGE | AF | SH_INNER | ATTR_NORMAL | AP_EL0 | PXN;
    /// User data: RW at EL0, no execution from anywhere.
    pub const USER_DATA: u64 = VALID | PAGE | AF | SH_INNER | ATTR_NORMAL | AP_EL0 | UXN | PXN;
    /// User read-only data.
    pub const USER_RODATA: u64 = USER_DATA | AP_RO;
    /// Intermediate table descriptor. The walk is safe regardless of
    /// leaf permissions; the extra low bits are ignored in table
    /// descriptors.
    pub const TABLE_DESC: u64 = VALID | TABLE | AF | SH_INNER | UXN | PXN;
}

/// A single translation table (512 entries, one frame).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create an empty page table.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [0; ENTRIES_PER_TABLE],
        }
    }

    /// Get an entry by index.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        self.entries[index]
    }

    /// Set an entry by index.
    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        self.entries[index] = value;
    }

    /// Check if an entry is valid.
    #[inline]
    #[must_use]
    pub fn is_valid(&self, index: usize) -> bool {
        self.entries[index] & flags::VALID != 0
    }

    /// Physical address referenced by a table entry.
    #[inline]
    #[must_use]
    pub fn table_address(&self, index: usize) -> u64 {
        self.entries[index] & PHYS_ADDR_MASK
    }

    /// View of the raw entries, for copying the kernel half into a new
    /// address space.
    #[must_use]
    pub fn entries(&self) -> &[u64; ENTRIES_PER_TABLE] {
        &self.entries
    }

    /// Mutable view of the raw entries.
    pub fn entries_mut(&mut self) -> &mut [u64; ENTRIES_PER_TABLE] {
        &mut self.entries
    }
}

/// Per-level indices of a virtual address.
#[derive(Debug, Clone, Copy)]
pub struct VirtAddrParts {
    /// Level 0 index.
    pub l0: usize,
    /// Level 1 index.
    pub l1: usize,
    /// Level 2 index.
    pub l2: usize,
    /// Level 3 index.
    pub l3: usize,
    /// Byte offset within the page.
    pub offset: usize,
}

impl VirtAddrParts {
    /// Split a virtual address into table indices.
    #[inline]
    #[must_use]
    pub const fn from_vaddr(vaddr: u64) -> Self {
        Self {
            l0: ((vaddr >> 39) & 0x1FF) as usize,
            l1: ((vaddr >> 30) & 0x1FF) as usize,
            l2: ((vaddr >> 21) & 0x1FF) as usize,
            l3: ((vaddr >> 12) & 0x1FF) as usize,
            offset: (vaddr & 0xFFF) as usize,
        }
    }
}

/// Program MAIR/TCR/TTBR0 and enable the MMU with both caches, in one
/// barrier-bracketed SCTLR store.
///
/// MAIR index 0 = normal write-back (0xFF), index 1 = device nGnRE
/// (0x04).
///
/// # Safety
///
/// `ttbr0` must be the physical address of a valid level-0 table whose
/// mappings cover the currently executing code identity-mapped;
/// otherwise the instruction after enabling translation faults.
pub unsafe fn enable(ttbr0: u64) {
    let mair: u64 = 0xFF | (0x04 << 8);
    MAIR_EL1.set(mair);

    let tcr: u64 = tcr_config::T0SZ
        | tcr_config::IPS_40BIT
        | tcr_config::SH0_INNER
        | tcr_config::ORGN0_WBWA
        | tcr_config::IRGN0_WBWA;
    TCR_EL1.set(tcr);

    TTBR0_EL1.set(ttbr0);

    dsb_sy();
    isb();
    invalidate_tlb_all();

    let mut sctlr = SCTLR_EL1.get();
    sctlr |= 1 << 0; // M: MMU enable
    sctlr |= 1 << 2; // C: data cache
    sctlr |= 1 << 12; // I: instruction cache
    SCTLR_EL1.set(sctlr);
    isb();
}

/// Switch TTBR0 to another address-space root without touching the TLB.
/// The caller is responsible for invalidation (no ASIDs in use).
pub fn set_ttbr0(ttbr0: u64) {
    TTBR0_EL1.set(ttbr0);
    isb();
}

/// Current TTBR0 base address, ASID bits masked off.
#[must_use]
pub fn ttbr0_base_address() -> u64 {
    TTBR0_EL1.get() & PHYS_ADDR_MASK
}

/// Invalidate the whole TLB.
pub fn invalidate_tlb_all() {
    // SAFETY: TLB invalidation only affects cached translations
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("tlbi vmalle1", "dsb ish", "isb", options(nostack));
    }
}

/// Invalidate the TLB entry for one virtual address, inner shareable.
pub fn invalidate_tlb_vaddr(vaddr: u64) {
    // SAFETY: TLB invalidation only affects cached translations
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vaae1is, {}",
            "dsb ish",
            "isb",
            in(reg) vaddr >> 12,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = vaddr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vaddr_parts() {
        let parts = VirtAddrParts::from_vaddr(0xC000_0000);
        assert_eq!(parts.l0, 0);
        assert_eq!(parts.l1, 3);
        assert_eq!(parts.l2, 0);
        assert_eq!(parts.l3, 0);
        assert_eq!(parts.offset, 0);

        let parts = VirtAddrParts::from_vaddr(0x4000_1234);
        assert_eq!(parts.l1, 1);
        assert_eq!(parts.l3, 1);
        assert_eq!(parts.offset, 0x234);
    }

    #[test]
    fn test_leaf_flag_invariants() {
        // Every leaf carries the access flag.
        for leaf in [
            flags::KERNEL,
            flags::DEVICE,
            flags::USER_CODE,
            flags::USER_DATA,
            flags::USER_RODATA,
        ] {
            assert_ne!(leaf & flags::AF, 0);
            assert_ne!(leaf & flags::VALID, 0);
        }
        // Device leaves: device attribute plus both execute-never bits.
        assert_ne!(flags::DEVICE & flags::ATTR_DEVICE, 0);
        assert_ne!(flags::DEVICE & flags::UXN, 0);
        assert_ne!(flags::DEVICE & flags::PXN, 0);
        // User-executable pages are never kernel-executable.
        assert_ne!(flags::USER_CODE & flags::PXN, 0);
    }

    #[test]
    fn test_page_table_is_one_frame() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
