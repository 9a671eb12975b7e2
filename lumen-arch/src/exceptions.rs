//! Exception Handling for ARM64
//!
//! Implements the exception vector table and the saved register frame.
//!
//! Every entry from EL0 or EL1 stacks a full [`TrapFrame`] on the current
//! kernel stack and calls the registered Rust handler with a pointer to
//! it. The handler *returns* the frame pointer to restore from: returning
//! the same pointer resumes the interrupted context, returning a
//! different process's saved frame context-switches, because the epilogue
//! reloads SP from the returned pointer before popping.

use crate::registers::{esr, write_vbar_el1};
use core::sync::atomic::{AtomicPtr, Ordering};

/// Saved register frame stacked on every exception entry.
///
/// Layout must match the assembly stubs below: 31 general registers, the
/// user stack pointer, ELR, SPSR, then the syndrome and fault address
/// sampled at entry. 36 * 8 = 288 bytes, 16-byte aligned.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    /// General purpose registers x0-x30.
    pub gpr: [u64; 31],
    /// SP_EL0 (user stack pointer).
    pub sp: u64,
    /// Exception link register (return address).
    pub elr: u64,
    /// Saved program status register.
    pub spsr: u64,
    /// Exception syndrome register, sampled at entry.
    pub esr: u64,
    /// Fault address register, sampled at entry.
    pub far: u64,
}

impl TrapFrame {
    /// A zeroed frame.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            gpr: [0; 31],
            sp: 0,
            elr: 0,
            spsr: 0,
            esr: 0,
            far: 0,
        }
    }

    /// Get the exception class from the sampled ESR.
    #[must_use]
    pub fn exception_class(&self) -> u8 {
        esr::exception_class(self.esr)
    }

    /// Check whether the exception was taken from EL0.
    #[must_use]
    pub fn from_el0(&self) -> bool {
        (self.spsr & 0x0F) == 0
    }
}

/// Exception handler function type.
///
/// Receives the frame stacked at entry; returns the frame to restore
/// from (usually the same pointer).
pub type ExceptionHandler = fn(*mut TrapFrame) -> *mut TrapFrame;

static SYNC_HANDLER: AtomicPtr<()> = AtomicPtr::new(default_handler as *mut ());
static IRQ_HANDLER: AtomicPtr<()> = AtomicPtr::new(default_handler as *mut ());
static SERROR_HANDLER: AtomicPtr<()> = AtomicPtr::new(default_handler as *mut ());

/// Set the synchronous exception handler.
pub fn set_sync_handler(handler: ExceptionHandler) {
    SYNC_HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Set the IRQ handler.
pub fn set_irq_handler(handler: ExceptionHandler) {
    IRQ_HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Set the SError handler.
pub fn set_serror_handler(handler: ExceptionHandler) {
    SERROR_HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Load a handler previously stored by one of the setters.
#[inline]
fn load_handler(slot: &AtomicPtr<()>) -> ExceptionHandler {
    let ptr = slot.load(Ordering::Acquire);
    // SAFETY: The pointer was stored as a valid ExceptionHandler
    unsafe { core::mem::transmute(ptr) }
}

/// Default handler: any exception before the kernel installs its own is
/// unrecoverable.
fn default_handler(frame: *mut TrapFrame) -> *mut TrapFrame {
    // SAFETY: The stubs pass a valid frame pointer
    let f = unsafe { &*frame };
    panic!(
        "Early exception: EC={:#x} ELR={:#x} ESR={:#x} FAR={:#x}",
        f.exception_class(),
        f.elr,
        f.esr,
        f.far
    );
}

#[unsafe(no_mangle)]
extern "C" fn handle_sync(frame: *mut TrapFrame) -> *mut TrapFrame {
    load_handler(&SYNC_HANDLER)(frame)
}

#[unsafe(no_mangle)]
extern "C" fn handle_irq(frame: *mut TrapFrame) -> *mut TrapFrame {
    load_handler(&IRQ_HANDLER)(frame)
}

#[unsafe(no_mangle)]
extern "C" fn handle_serror(frame: *mut TrapFrame) -> *mut TrapFrame {
    load_handler(&SERROR_HANDLER)(frame)
}

/// Exception vector stub - fits within the 128-byte vector slot.
///
/// Saves the full frame and branches to a continuation.
///
/// Frame layout (36 * 8 = 288 bytes):
/// - x0-x30: offsets 0..248
/// - SP_EL0: offset 248 (31 * 8)
/// - ELR_EL1: offset 256 (32 * 8)
/// - SPSR_EL1: offset 264 (33 * 8)
/// - ESR_EL1: offset 272 (34 * 8)
/// - FAR_EL1: offset 280 (35 * 8)
#[cfg(target_arch = "aarch64")]
macro_rules! exception_stub {
    ($continuation:ident) => {
        concat!(
            "sub sp, sp, #(36 * 8)\n",
            "stp x0, x1, [sp, #(0 * 16)]\n",
            "stp x2, x3, [sp, #(1 * 16)]\n",
            "stp x4, x5, [sp, #(2 * 16)]\n",
            "stp x6, x7, [sp, #(3 * 16)]\n",
            "stp x8, x9, [sp, #(4 * 16)]\n",
            "stp x10, x11, [sp, #(5 * 16)]\n",
            "stp x12, x13, [sp, #(6 * 16)]\n",
            "stp x14, x15, [sp, #(7 * 16)]\n",
            "stp x16, x17, [sp, #(8 * 16)]\n",
            "stp x18, x19, [sp, #(9 * 16)]\n",
            "stp x20, x21, [sp, #(10 * 16)]\n",
            "stp x22, x23, [sp, #(11 * 16)]\n",
            "stp x24, x25, [sp, #(12 * 16)]\n",
            "stp x26, x27, [sp, #(13 * 16)]\n",
            "stp x28, x29, [sp, #(14 * 16)]\n",
            "str x30, [sp, #(15 * 16)]\n",
            "mrs x0, sp_el0\n",
            "mrs x1, elr_el1\n",
            "mrs x2, spsr_el1\n",
            "mrs x3, esr_el1\n",
            "mrs x4, far_el1\n",
            "stp x0, x1, [sp, #(31 * 8)]\n",
            "stp x2, x3, [sp, #(33 * 8)]\n",
            "str x4, [sp, #(35 * 8)]\n",
            "b ", stringify!($continuation), "\n",
        )
    };
}

/// Exception continuation: call the Rust handler, then restore from the
/// frame pointer it RETURNS. `mov sp, x0` is what makes a scheduler-
/// selected frame the one that `eret` lands in.
#[cfg(target_arch = "aarch64")]
macro_rules! exception_continuation {
    ($handler:ident) => {
        concat!(
            "mov x0, sp\n",
            "bl ", stringify!($handler), "\n",
            "mov sp, x0\n",
            "ldp x0, x1, [sp, #(31 * 8)]\n",
            "ldr x2, [sp, #(33 * 8)]\n",
            "msr sp_el0, x0\n",
            "msr elr_el1, x1\n",
            "msr spsr_el1, x2\n",
            "ldp x0, x1, [sp, #(0 * 16)]\n",
            "ldp x2, x3, [sp, #(1 * 16)]\n",
            "ldp x4, x5, [sp, #(2 * 16)]\n",
            "ldp x6, x7, [sp, #(3 * 16)]\n",
            "ldp x8, x9, [sp, #(4 * 16)]\n",
            "ldp x10, x11, [sp, #(5 * 16)]\n",
            "ldp x12, x13, [sp, #(6 * 16)]\n",
            "ldp x14, x15, [sp, #(7 * 16)]\n",
            "ldp x16, x17, [sp, #(8 * 16)]\n",
            "ldp x18, x19, [sp, #(9 * 16)]\n",
            "ldp x20, x21, [sp, #(10 * 16)]\n",
            "ldp x22, x23, [sp, #(11 * 16)]\n",
            "ldp x24, x25, [sp, #(12 * 16)]\n",
            "ldp x26, x27, [sp, #(13 * 16)]\n",
            "ldp x28, x29, [sp, #(14 * 16)]\n",
            "ldr x30, [sp, #(15 * 16)]\n",
            "add sp, sp, #(36 * 8)\n",
            "eret\n"
        )
    };
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
#[unsafe(no_mangle)]
unsafe extern "C" fn __exc_sync_cont() {
    core::arch::naked_asm!(exception_continuation!(handle_sync));
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
#[unsafe(no_mangle)]
unsafe extern "C" fn __exc_irq_cont() {
    core::arch::naked_asm!(exception_continuation!(handle_irq));
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
#[unsafe(no_mangle)]
unsafe extern "C" fn __exc_serror_cont() {
    core::arch::naked_asm!(exception_continuation!(handle_serror));
}

/// The exception vector table.
///
/// 16 entries of 128 bytes, 2 KiB aligned: four exception kinds for each
/// of {current EL / SP_EL0, current EL / SP_ELx, lower EL AArch64,
/// lower EL AArch32}. Only the SP_ELx and lower-AArch64 banks are used;
/// FIQ is never enabled and hangs if it ever fires.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
#[unsafe(no_mangle)]
#[unsafe(link_section = ".vectors")]
unsafe extern "C" fn exception_vectors() {
    core::arch::naked_asm!(
        ".balign 2048",
        // Current EL with SP_EL0 (not used)
        ".balign 128",
        "b .",
        ".balign 128",
        "b .",
        ".balign 128",
        "b .",
        ".balign 128",
        "b .",
        // Current EL with SP_ELx (kernel mode)
        ".balign 128",
        exception_stub!(__exc_sync_cont),
        ".balign 128",
        exception_stub!(__exc_irq_cont),
        ".balign 128",
        "b .",
        ".balign 128",
        exception_stub!(__exc_serror_cont),
        // Lower EL using AArch64 (user mode)
        ".balign 128",
        exception_stub!(__exc_sync_cont),
        ".balign 128",
        exception_stub!(__exc_irq_cont),
        ".balign 128",
        "b .",
        ".balign 128",
        exception_stub!(__exc_serror_cont),
        // Lower EL using AArch32 (not supported)
        ".balign 128",
        "b .",
        ".balign 128",
        "b .",
        ".balign 128",
        "b .",
        ".balign 128",
        "b .",
    );
}

/// Install the exception vector table.
pub fn init() {
    #[cfg(target_arch = "aarch64")]
    write_vbar_el1(exception_vectors as *const () as u64);
    #[cfg(not(target_arch = "aarch64"))]
    write_vbar_el1(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, sp), 31 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, elr), 32 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, spsr), 33 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, esr), 34 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, far), 35 * 8);
    }

    #[test]
    fn test_from_el0() {
        let mut f = TrapFrame::zeroed();
        assert!(f.from_el0());
        f.spsr = 0b0101; // EL1h
        assert!(!f.from_el0());
    }
}
