//! Device Drivers
//!
//! VirtIO MMIO transport ([`virtio`]), the split-ring queue protocol
//! ([`virtqueue`]), and the block, input, and GPU drivers on top.

pub mod blk;
pub mod gpu;
pub mod input;
pub mod virtio;
pub mod virtqueue;
