//! QEMU `virt` Machine Layout
//!
//! Physical memory map, MMIO aperture, and interrupt line assignments for
//! the single supported platform. All devices are identity-mapped with
//! device attributes by the VMM at bring-up.
//!
//! ```text
//! 0x0800_0000  GIC distributor
//! 0x0801_0000  GIC CPU interface
//! 0x0900_0000  PL011 UART
//! 0x0A00_0000  VirtIO MMIO band (32 slots x 0x200)
//! 0x4000_0000  DRAM (1 GiB managed)
//! ```

/// Physical memory regions.
pub mod mem {
    /// Start of DRAM.
    pub const RAM_BASE: u64 = 0x4000_0000;

    /// Amount of DRAM the kernel manages.
    pub const RAM_SIZE: u64 = 1 << 30;

    /// End of the DMA-eligible zone: the first 16 MiB of DRAM.
    pub const DMA_ZONE_END: u64 = RAM_BASE + (16 << 20);

    /// Start of the identity-mapped MMIO aperture.
    pub const MMIO_BASE: u64 = 0x0800_0000;

    /// End (exclusive) of the identity-mapped MMIO aperture, past the
    /// VirtIO band.
    pub const MMIO_END: u64 = 0x0A80_0000;
}

/// Device register bases.
pub mod dev {
    /// GIC distributor.
    pub const GICD_BASE: u64 = 0x0800_0000;

    /// GIC CPU interface.
    pub const GICC_BASE: u64 = 0x0801_0000;

    /// PL011 UART.
    pub const UART_BASE: u64 = 0x0900_0000;

    /// First VirtIO MMIO slot.
    pub const VIRTIO_BASE: u64 = 0x0A00_0000;

    /// Bytes between consecutive VirtIO slots.
    pub const VIRTIO_STRIDE: u64 = 0x200;

    /// Number of VirtIO slots probed.
    pub const VIRTIO_SLOTS: usize = 32;
}

/// Interrupt line assignments.
pub mod irq {
    /// EL1 virtual timer (PPI).
    pub const TIMER_VIRT: u32 = 27;

    /// PL011 UART (SPI).
    pub const UART: u32 = 33;

    /// First VirtIO slot; slot `n` interrupts on `VIRTIO_BASE + n`.
    pub const VIRTIO_BASE: u32 = 48;
}

/// Scheduler tick rate in Hz.
pub const HZ: u64 = 100;

/// User stack region: 1 MiB ending at the initial stack pointer.
pub mod user {
    /// Lowest address of the user stack mapping.
    pub const STACK_BASE: u64 = 0xC000_0000;

    /// Size of the user stack mapping.
    pub const STACK_SIZE: u64 = 0x10_0000;

    /// Initial user stack pointer (stack grows down from here).
    pub const STACK_TOP: u64 = STACK_BASE + STACK_SIZE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_split_inside_ram() {
        assert!(mem::DMA_ZONE_END > mem::RAM_BASE);
        assert!(mem::DMA_ZONE_END < mem::RAM_BASE + mem::RAM_SIZE);
    }

    #[test]
    fn test_virtio_band_inside_aperture() {
        let last = dev::VIRTIO_BASE + (dev::VIRTIO_SLOTS as u64 - 1) * dev::VIRTIO_STRIDE;
        assert!(dev::VIRTIO_BASE >= mem::MMIO_BASE);
        assert!(last + dev::VIRTIO_STRIDE <= mem::MMIO_END);
    }

    #[test]
    fn test_user_stack_outside_ram_identity_map() {
        assert!(user::STACK_BASE >= mem::RAM_BASE + mem::RAM_SIZE);
    }
}
