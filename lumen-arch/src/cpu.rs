//! CPU Control
//!
//! Low-level CPU operations: interrupt masking, wait states, barriers.

use aarch64_cpu::registers::*;
#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Get the current exception level.
#[must_use]
pub fn current_el() -> u8 {
    ((CurrentEL.get() >> 2) & 0x3) as u8
}

/// Halt the CPU forever.
#[inline]
pub fn halt() -> ! {
    loop {
        wait_for_interrupt();
    }
}

/// Wait for interrupt (WFI instruction).
#[inline]
pub fn wait_for_interrupt() {
    // SAFETY: WFI is always safe to call
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("wfi", options(nomem, nostack));
    }
}

/// Wait for event (WFE instruction).
#[inline]
pub fn wait_for_event() {
    // SAFETY: WFE is always safe to call
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("wfe", options(nomem, nostack));
    }
}

/// Send event (SEV instruction).
#[inline]
pub fn send_event() {
    // SAFETY: SEV is always safe to call
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("sev", options(nomem, nostack));
    }
}

/// Data synchronization barrier, full system.
#[inline]
pub fn dsb_sy() {
    // SAFETY: Memory barrier is always safe
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Data memory barrier, full system.
#[inline]
pub fn dmb_sy() {
    // SAFETY: Memory barrier is always safe
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dmb sy", options(nostack));
    }
}

/// Instruction synchronization barrier.
#[inline]
pub fn isb() {
    // SAFETY: ISB is always safe
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Enable FP/SIMD access at EL0 and EL1.
///
/// Sets CPACR_EL1.FPEN = 0b11. Must run before any FP/SIMD code.
#[inline]
pub fn enable_fp_simd() {
    // SAFETY: Enabling FP/SIMD access is safe in kernel mode
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!(
            "mrs {tmp}, cpacr_el1",
            "orr {tmp}, {tmp}, #(3 << 20)",
            "msr cpacr_el1, {tmp}",
            "isb",
            tmp = out(reg) _,
            options(nomem, nostack)
        );
    }
}

/// Disable all interrupts and return the previous DAIF state.
#[must_use]
#[inline]
pub fn disable_interrupts() -> u64 {
    let daif = DAIF.get();
    // SAFETY: Masking DAIF is safe in kernel mode
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("msr daifset, #0xf", options(nomem, nostack));
    }
    daif
}

/// Enable all interrupts.
#[inline]
pub fn enable_interrupts() {
    // SAFETY: Unmasking DAIF is safe in kernel mode
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("msr daifclr, #0xf", options(nomem, nostack));
    }
}

/// Restore a DAIF state previously returned by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(daif: u64) {
    DAIF.set(daif);
}

/// Check whether IRQs are currently unmasked.
#[must_use]
pub fn interrupts_enabled() -> bool {
    (DAIF.get() & 0xC0) == 0
}
