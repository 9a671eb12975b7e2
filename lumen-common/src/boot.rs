//! Boot Contract
//!
//! The external boot stub enters the kernel at `kernel_main` with:
//! - a single hart active, at EL1
//! - the MMU off and all interrupts masked
//! - `SP` pointing at a valid early stack inside the kernel image
//!
//! If the stub carries extra information it stores a pointer to it in the
//! kernel's `boot_info` symbol before jumping; a zero value means
//! "nothing provided" and the kernel falls back to the fixed layout in
//! [`crate::layout`]. The kernel image bounds arrive as the linker
//! symbols `__kernel_start` / `__kernel_end`, consumed by the frame
//! allocator to reserve the image's frames.

use crate::PhysAddr;

/// Information optionally published by the boot stub.
///
/// The current stub publishes nothing beyond the pointer itself; the
/// struct exists so the handoff has a typed shape to grow into.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct BootInfo {
    /// Physical address of a device tree blob, or null.
    pub dtb: PhysAddr,
}
