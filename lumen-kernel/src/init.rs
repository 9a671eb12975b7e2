//! Kernel Bring-Up
//!
//! Initialization order: console/logging, CPU (vectors, handlers), GIC,
//! timer, frame allocator, MMU, block, GPU, compositor, GPT, ext4 (with
//! its buffer cache), input, then the boot processes. The first user
//! process is entered directly; the boot context becomes the idle loop
//! only if nothing could be loaded.

use lumen_arch::cpu;
use lumen_common::layout::{HZ, irq as lines};
use lumen_common::PhysAddr;

use crate::compositor;
use crate::console;
use crate::drivers;
use crate::fs;
use crate::irq;
use crate::logging;
use crate::memory::{vm, zones};
use crate::task::{self, loader};
use crate::time;
use crate::trap;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bounds of the kernel image, provided by the linker script.
unsafe extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Kernel entry, called by the boot stub at EL1 with the MMU off and
/// interrupts masked.
pub fn kmain(boot_info: u64) -> ! {
    logging::init();
    banner();
    if boot_info != 0 {
        log::info!("boot: boot_info at {:#x}", boot_info);
    }

    log::info!("cpu: at EL{}", cpu::current_el());
    cpu::enable_fp_simd();
    lumen_arch::exceptions::init();
    trap::init();

    irq::init();
    irq::init_percpu();

    time::init();
    time::init_percpu();

    let image_start = PhysAddr::new(core::ptr::addr_of!(__kernel_start) as u64);
    let image_end = PhysAddr::new(core::ptr::addr_of!(__kernel_end) as u64);
    zones::reserve_range(image_start, image_end);
    zones::log_stats();

    // SAFETY: Runs once, on the boot hart, with the MMU off.
    unsafe { vm::init() };

    drivers::blk::init();
    drivers::gpu::init();
    compositor::init();

    fs::gpt::init();
    fs::ext4::init();

    drivers::input::init();
    console::enable_rx_irq();
    irq::enable(lines::UART);

    log::info!("kernel initialized");

    let init_pid = loader::spawn("init", "/init");
    let _ = loader::spawn("shell1", "/shell");
    let _ = loader::spawn("shell2", "/shell");

    match init_pid {
        // Interrupts stay masked until the exception return; the first
        // tick preempts the first user instruction onwards.
        Some(pid) => task::start_user_process(pid),
        None => {
            log::error!("boot: no init process; idling");
            idle()
        }
    }
}

fn banner() {
    console::puts("\n");
    console::puts("========================================\n");
    console::puts("  Lumen ");
    console::puts(VERSION);
    console::puts(" / AArch64 QEMU virt\n");
    console::puts("========================================\n\n");
}

/// Idle loop with a once-per-second heartbeat.
fn idle() -> ! {
    cpu::enable_interrupts();
    let mut last = 0;
    loop {
        let now = time::jiffies();
        if now != last && now % HZ == 0 {
            log::info!("idle: {} s", now / HZ);
            last = now;
        }
        cpu::wait_for_interrupt();
    }
}
