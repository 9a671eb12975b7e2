//! Kernel binary entry.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU64, Ordering};

/// Populated by the boot stub before it jumps to `kernel_main`; zero
/// when the stub has nothing to say.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
static boot_info: AtomicU64 = AtomicU64::new(0);

/// Entry from the boot stub: single hart, EL1, MMU off, interrupts
/// masked.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    lumen_kernel::kmain(boot_info.load(Ordering::Relaxed))
}
