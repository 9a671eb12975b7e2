//! Driver Memory Barriers
//!
//! Virtqueue submissions are visible to the device only after an
//! explicit barrier following the available-index store; completions are
//! read only after a barrier once the used index is observed to advance.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Full-system data memory barrier: order ring writes before the
/// index store the device polls.
#[inline]
pub fn dmb_sy() {
    // SAFETY: Barriers are always safe
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dmb sy", options(nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Read barrier: order the used-index load before reading completion
/// payloads.
#[inline]
pub fn read_barrier() {
    // SAFETY: Barriers are always safe
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dmb ld", options(nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
}
