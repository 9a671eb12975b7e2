//! System Register Access
//!
//! Register helpers not covered by `aarch64-cpu`, plus ESR decoding.

use aarch64_cpu::registers::{ELR_EL1, ESR_EL1, FAR_EL1, SPSR_EL1, VBAR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

/// Read VBAR_EL1 (Vector Base Address Register).
#[must_use]
#[inline]
pub fn read_vbar_el1() -> u64 {
    VBAR_EL1.get()
}

/// Write VBAR_EL1 (Vector Base Address Register).
///
/// The address must point to a valid, 2 KiB-aligned vector table.
#[inline]
pub fn write_vbar_el1(value: u64) {
    VBAR_EL1.set(value);
}

/// Read ESR_EL1 (Exception Syndrome Register).
#[must_use]
#[inline]
pub fn read_esr_el1() -> u64 {
    ESR_EL1.get()
}

/// Read ELR_EL1 (Exception Link Register).
#[must_use]
#[inline]
pub fn read_elr_el1() -> u64 {
    ELR_EL1.get()
}

/// Read FAR_EL1 (Fault Address Register).
#[must_use]
#[inline]
pub fn read_far_el1() -> u64 {
    FAR_EL1.get()
}

/// Read SPSR_EL1 (Saved Program Status Register).
#[must_use]
#[inline]
pub fn read_spsr_el1() -> u64 {
    SPSR_EL1.get()
}

/// Exception Syndrome Register parsing.
pub mod esr {
    /// Exception class (EC) field, bits [31:26].
    #[inline]
    pub const fn exception_class(esr: u64) -> u8 {
        ((esr >> 26) & 0x3F) as u8
    }

    /// Instruction-specific syndrome (ISS), bits [24:0].
    #[inline]
    pub const fn iss(esr: u64) -> u32 {
        (esr & 0x1FF_FFFF) as u32
    }

    /// Known exception class values.
    pub mod ec {
        /// Unknown reason.
        pub const UNKNOWN: u8 = 0x00;
        /// SVC instruction from AArch64.
        pub const SVC_AARCH64: u8 = 0x15;
        /// Instruction abort from a lower exception level.
        pub const INSTRUCTION_ABORT_LOWER: u8 = 0x20;
        /// Instruction abort from the current exception level.
        pub const INSTRUCTION_ABORT_SAME: u8 = 0x21;
        /// PC alignment fault.
        pub const PC_ALIGNMENT: u8 = 0x22;
        /// Data abort from a lower exception level.
        pub const DATA_ABORT_LOWER: u8 = 0x24;
        /// Data abort from the current exception level.
        pub const DATA_ABORT_SAME: u8 = 0x25;
        /// SP alignment fault.
        pub const SP_ALIGNMENT: u8 = 0x26;
    }

    /// Human-readable name for an exception class.
    #[must_use]
    pub fn ec_name(value: u8) -> &'static str {
        match value {
            ec::UNKNOWN => "Unknown",
            ec::SVC_AARCH64 => "SVC (AArch64)",
            ec::INSTRUCTION_ABORT_LOWER => "Instruction abort (lower EL)",
            ec::INSTRUCTION_ABORT_SAME => "Instruction abort (same EL)",
            ec::PC_ALIGNMENT => "PC alignment fault",
            ec::DATA_ABORT_LOWER => "Data abort (lower EL)",
            ec::DATA_ABORT_SAME => "Data abort (same EL)",
            ec::SP_ALIGNMENT => "SP alignment fault",
            _ => "Unrecognized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::esr;

    #[test]
    fn test_exception_class_extraction() {
        // SVC #0 from AArch64: EC=0x15, IL=1, ISS=0
        let syndrome = (0x15u64 << 26) | (1 << 25);
        assert_eq!(esr::exception_class(syndrome), esr::ec::SVC_AARCH64);
        assert_eq!(esr::iss(syndrome), 0);
    }

    #[test]
    fn test_iss_masks_low_bits_only() {
        let syndrome = (0x24u64 << 26) | 0x1FF_FFFF;
        assert_eq!(esr::exception_class(syndrome), esr::ec::DATA_ABORT_LOWER);
        assert_eq!(esr::iss(syndrome), 0x1FF_FFFF);
    }
}
