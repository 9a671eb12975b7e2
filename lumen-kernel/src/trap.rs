//! Exception Routing
//!
//! Wires the vector-table hooks to the kernel's handlers:
//! - synchronous from EL0: supervisor calls, else the process dies
//! - synchronous from EL1: kernel fault, panic
//! - IRQ: the GIC dispatch loop (timer ticks may switch frames)
//! - SError: panic

use lumen_arch::cpu;
use lumen_arch::exceptions::{self, TrapFrame};
use lumen_arch::registers::esr;

use crate::task;

/// Install all handlers. Runs once at CPU bring-up, after the vector
/// table itself is installed.
pub fn init() {
    exceptions::set_sync_handler(sync_handler);
    exceptions::set_irq_handler(irq_handler);
    exceptions::set_serror_handler(serror_handler);
}

fn sync_handler(frame: *mut TrapFrame) -> *mut TrapFrame {
    // SAFETY: The vector stub passes the frame it just stacked
    let f = unsafe { &mut *frame };
    let ec = f.exception_class();

    if f.from_el0() {
        if ec == esr::ec::SVC_AARCH64 {
            return crate::syscall::handle(frame);
        }
        log::error!(
            "user fault: {} ESR={:#x} FAR={:#x} ELR={:#x}",
            esr::ec_name(ec),
            f.esr,
            f.far,
            f.elr
        );
        fatal_process();
    }

    panic!(
        "kernel fault: {} ESR={:#x} FAR={:#x} ELR={:#x}",
        esr::ec_name(ec),
        f.esr,
        f.far,
        f.elr
    );
}

fn irq_handler(frame: *mut TrapFrame) -> *mut TrapFrame {
    crate::irq::dispatch(frame)
}

fn serror_handler(frame: *mut TrapFrame) -> *mut TrapFrame {
    // SAFETY: The vector stub passes the frame it just stacked
    let f = unsafe { &*frame };
    panic!("SError: ESR={:#x} ELR={:#x}", f.esr, f.elr);
}

/// Fatal-process path: mark the current process exited and park.
pub fn fatal_process() -> ! {
    task::exit_current(-1);
    park_current()
}

/// Park the hart with interrupts enabled until the next tick schedules
/// away; an exited slot is never selected again, so this context is
/// simply abandoned.
pub fn park_current() -> ! {
    cpu::enable_interrupts();
    loop {
        cpu::wait_for_event();
    }
}
