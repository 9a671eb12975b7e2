//! Periodic Timer
//!
//! Programs the EL1 virtual timer for fixed-rate ticks (HZ = 100),
//! maintains the monotonic jiffies counter, walks the software-timer
//! list, and hands each tick to the scheduler as the universal
//! preemption point.

use core::sync::atomic::{AtomicU64, Ordering};

use aarch64_cpu::registers::{CNTFRQ_EL0, CNTV_CTL_EL0, CNTV_CVAL_EL0, CNTVCT_EL0};
use alloc::vec::Vec;
use lumen_arch::IrqSpinMutex;
use lumen_arch::exceptions::TrapFrame;
use lumen_common::layout::{HZ, irq as lines};
use tock_registers::interfaces::{Readable, Writeable};

/// Counter frequency, read once at init.
static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick count since boot.
static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// Timer control register bits.
mod ctl {
    /// Timer enabled.
    pub const ENABLE: u64 = 1 << 0;
}

/// A pending software timer.
pub struct SoftTimer {
    /// Jiffies value at which the callback fires.
    pub expires: u64,
    /// Invoked from the tick handler with interrupts masked.
    pub callback: fn(usize),
    /// Opaque word passed to the callback.
    pub data: usize,
}

static SOFT_TIMERS: IrqSpinMutex<Vec<SoftTimer>> = IrqSpinMutex::new(Vec::new());

/// Read the virtual counter.
#[must_use]
pub fn read_counter() -> u64 {
    CNTVCT_EL0.get()
}

/// Current jiffies value.
#[must_use]
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

/// Counter frequency in Hz.
#[must_use]
pub fn frequency() -> u64 {
    TIMER_FREQ.load(Ordering::Relaxed)
}

/// Read the counter frequency and leave the timer disabled.
pub fn init() {
    let freq = CNTFRQ_EL0.get();
    TIMER_FREQ.store(freq, Ordering::Relaxed);
    CNTV_CTL_EL0.set(0);
    log::info!("timer: {} Hz counter, {} Hz tick", freq, HZ);
}

/// Arm the first tick and enable the timer line. Runs per hart.
pub fn init_percpu() {
    let freq = frequency();
    CNTV_CVAL_EL0.set(read_counter() + freq / HZ);
    CNTV_CTL_EL0.set(ctl::ENABLE);
    crate::irq::enable(lines::TIMER_VIRT);
}

/// Tick handler, called from IRQ dispatch with interrupts masked.
///
/// Advances jiffies, re-arms the compare register, fires expired
/// software timers, then lets the scheduler choose the frame to resume.
pub fn handle_tick(frame: *mut TrapFrame) -> *mut TrapFrame {
    let now = JIFFIES.fetch_add(1, Ordering::Relaxed) + 1;

    CNTV_CVAL_EL0.set(read_counter() + frequency() / HZ);

    // Collect expired timers first so callbacks run without the list
    // lock held.
    let mut expired: Vec<SoftTimer> = Vec::new();
    {
        let mut timers = SOFT_TIMERS.lock();
        let mut i = 0;
        while i < timers.len() {
            if now >= timers[i].expires {
                expired.push(timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }
    for timer in expired {
        (timer.callback)(timer.data);
    }

    crate::task::schedule(frame)
}

/// Arm a software timer to fire at an absolute jiffies value.
pub fn timer_add(expires: u64, callback: fn(usize), data: usize) {
    SOFT_TIMERS.lock().push(SoftTimer {
        expires,
        callback,
        data,
    });
}

/// Cancel all software timers with the given callback/data pair.
pub fn timer_del(callback: fn(usize), data: usize) {
    SOFT_TIMERS
        .lock()
        .retain(|t| !(core::ptr::fn_addr_eq(t.callback, callback) && t.data == data));
}

/// Busy-wait for `us` microseconds on the virtual counter. Only for
/// contexts where a long stall is acceptable.
pub fn delay_us(us: u64) {
    let freq = frequency();
    if freq == 0 {
        for _ in 0..us * 100 {
            core::hint::spin_loop();
        }
        return;
    }
    let ticks = us * freq / 1_000_000;
    let start = read_counter();
    while read_counter().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

/// Busy-wait for `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    delay_us(ms * 1000);
}
