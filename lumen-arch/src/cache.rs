//! Cache Maintenance
//!
//! The ELF loader writes instructions through the data cache; before the
//! first fetch those lines must be cleaned to the point of unification
//! and the instruction cache invalidated.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Data cache line size assumed for maintenance loops.
pub const DCACHE_LINE: usize = 64;

/// Clean one data cache line (by VA) to the point of unification.
#[inline]
pub fn clean_dcache_line_pou(addr: u64) {
    // SAFETY: Cache maintenance is safe on any mapped address
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dc cvau, {}", in(reg) addr, options(nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = addr;
}

/// Clean a byte range to the point of unification, line by line.
pub fn clean_dcache_range_pou(start: u64, len: usize) {
    let mut line = start & !(DCACHE_LINE as u64 - 1);
    let end = start + len as u64;
    while line < end {
        clean_dcache_line_pou(line);
        line += DCACHE_LINE as u64;
    }
}

/// Invalidate the entire instruction cache and synchronize the
/// instruction stream. Run after all executable bytes are written and
/// cleaned.
#[inline]
pub fn invalidate_icache_all() {
    // SAFETY: Cache maintenance is safe in kernel mode
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb ish", "ic iallu", "dsb ish", "isb", options(nostack));
    }
}
