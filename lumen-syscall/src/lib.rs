//! # lumen-syscall
//!
//! The supervisor-call ABI shared by the kernel and user programs.
//!
//! # ARM64 ABI
//!
//! Standard 64-bit ARM Linux conventions:
//! - x8: syscall number
//! - x0-x5: arguments
//! - x0: return value (negative = error)

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod invoke;
pub mod numbers;

pub use numbers::Syscall;

/// Sentinel returned to user code for unknown syscalls and failed
/// graphics operations.
pub const ERR_SENTINEL: i64 = -1;
