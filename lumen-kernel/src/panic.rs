//! Panic Handling
//!
//! Fatal-kernel path: mask all exceptions, write the message straight to
//! the UART (bypassing the logger), then park in a wait-for-event loop.
//! No unwinding, no cleanup.

use crate::console;

/// Mask exceptions, report, and park the hart.
pub fn park(info: &core::panic::PanicInfo) -> ! {
    let _ = lumen_arch::cpu::disable_interrupts();

    use core::fmt::Write;
    let mut out = console::ConsoleWriter;
    let _ = writeln!(out, "\n\x1b[31mKERNEL PANIC\x1b[0m: {}", info.message());
    if let Some(location) = info.location() {
        let _ = writeln!(out, "  at {}:{}", location.file(), location.line());
    }

    loop {
        lumen_arch::cpu::wait_for_event();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    park(info)
}
