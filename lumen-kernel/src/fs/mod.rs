//! On-Disk Data
//!
//! - [`gpt`]: partition discovery
//! - [`cache`]: the 4 KiB block buffer cache
//! - [`ext4`]: the simplified read-only ext4 driver feeding the ELF
//!   loader

pub mod cache;
pub mod ext4;
pub mod gpt;
