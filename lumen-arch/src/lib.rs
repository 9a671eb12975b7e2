//! # lumen-arch
//!
//! ARM64 architecture support for the Lumen kernel:
//! - [`cpu`]: CPU control (halt, interrupt masking, barriers)
//! - [`mmu`]: MMU configuration, page-table entries, TLB management
//! - [`cache`]: data and instruction cache maintenance
//! - [`exceptions`]: exception vector table and the saved register frame
//! - [`registers`]: system register access and ESR decoding
//! - [`sync`]: interrupt-masking spin lock
//!
//! # Safety
//!
//! This crate contains extensive `unsafe` code for hardware access. All
//! unsafe operations carry `// SAFETY:` comments stating the invariants
//! that must hold.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod cpu;
pub mod exceptions;
pub mod mmu;
pub mod registers;
pub mod sync;

pub use cpu::{halt, wait_for_interrupt};
pub use sync::IrqSpinMutex;
