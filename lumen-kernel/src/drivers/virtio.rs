//! VirtIO MMIO Transport
//!
//! Device probe and bring-up over the fixed slot band: magic check,
//! status dance, feature negotiation (accept everything offered), and
//! legacy/modern queue installation.

use lumen_common::layout::dev;
use lumen_mmio::MmioRegion;

use super::virtqueue::Virtqueue;

/// "virt" in little-endian.
pub const MAGIC: u32 = 0x7472_6976;

/// Device IDs this kernel drives.
pub mod device_id {
    /// Block device.
    pub const BLOCK: u32 = 2;
    /// GPU.
    pub const GPU: u32 = 16;
    /// Input (keyboard, mouse, tablet).
    pub const INPUT: u32 = 18;
}

/// Device status bits.
pub mod status {
    /// Guest noticed the device.
    pub const ACKNOWLEDGE: u32 = 1;
    /// Guest knows how to drive it.
    pub const DRIVER: u32 = 2;
    /// Driver is ready.
    pub const DRIVER_OK: u32 = 4;
    /// Feature negotiation finished.
    pub const FEATURES_OK: u32 = 8;
    /// Driver gave up.
    pub const FAILED: u32 = 128;
}

/// Register offsets within a slot.
mod regs {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const GUEST_PAGE_SIZE: usize = 0x028; // legacy
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03C; // legacy
    pub const QUEUE_PFN: usize = 0x040; // legacy
    pub const QUEUE_READY: usize = 0x044; // modern
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080; // modern
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_AVAIL_LOW: usize = 0x090;
    pub const QUEUE_AVAIL_HIGH: usize = 0x094;
    pub const QUEUE_USED_LOW: usize = 0x0A0;
    pub const QUEUE_USED_HIGH: usize = 0x0A4;
    pub const CONFIG: usize = 0x100;
}

/// Errors during device bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// Device rejected our accepted feature set.
    FeaturesRejected,
    /// Selected queue does not exist.
    NoQueue,
    /// No memory for the queue rings.
    OutOfMemory,
}

/// One claimed VirtIO MMIO slot.
pub struct VirtioMmio {
    regs: MmioRegion,
    slot: usize,
    version: u32,
}

impl VirtioMmio {
    /// Probe a slot; claim it if the magic matches and the device id is
    /// the expected one.
    #[must_use]
    pub fn probe(slot: usize, expected_id: u32) -> Option<Self> {
        if slot >= dev::VIRTIO_SLOTS {
            return None;
        }
        let base = dev::VIRTIO_BASE + slot as u64 * dev::VIRTIO_STRIDE;
        // SAFETY: Every slot lies inside the identity-mapped MMIO band
        let regs = unsafe { MmioRegion::new(base as usize, dev::VIRTIO_STRIDE as usize) };

        if regs.read32(regs::MAGIC) != MAGIC {
            return None;
        }
        if regs.read32(regs::DEVICE_ID) != expected_id {
            return None;
        }
        let version = regs.read32(regs::VERSION);
        Some(Self {
            regs,
            slot,
            version,
        })
    }

    /// Slot index within the band.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Transport version: 1 legacy, 2 modern.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Reset, acknowledge, and negotiate features (accept everything the
    /// device offers). On version >= 2 the FEATURES_OK handshake is
    /// verified.
    pub fn begin_init(&self) -> Result<(), VirtioError> {
        self.regs.write32(regs::STATUS, 0);
        let mut st = status::ACKNOWLEDGE | status::DRIVER;
        self.regs.write32(regs::STATUS, st);

        let offered = self.regs.read32(regs::DEVICE_FEATURES);
        self.regs.write32(regs::DRIVER_FEATURES, offered);

        if self.version >= 2 {
            st |= status::FEATURES_OK;
            self.regs.write32(regs::STATUS, st);
            if self.regs.read32(regs::STATUS) & status::FEATURES_OK == 0 {
                self.regs.write32(regs::STATUS, status::FAILED);
                return Err(VirtioError::FeaturesRejected);
            }
        }
        Ok(())
    }

    /// Install a virtqueue for `queue_index`. Picks the ring size (a
    /// power of two, at most `want`, bounded by the device maximum),
    /// allocates the ring memory, and programs either the legacy PFN or
    /// the modern split addresses.
    pub fn setup_queue(&self, queue_index: u32, want: u16) -> Result<Virtqueue, VirtioError> {
        self.regs.write32(regs::QUEUE_SEL, queue_index);

        let max = self.regs.read32(regs::QUEUE_NUM_MAX);
        if max == 0 {
            return Err(VirtioError::NoQueue);
        }
        let size = (want as u32).min(max) as u16;
        debug_assert!(size.is_power_of_two());
        self.regs.write32(regs::QUEUE_NUM, size as u32);

        let frames = super::virtqueue::QueueLayout::for_size(size).total / lumen_common::PAGE_SIZE;
        let phys = crate::memory::zones::alloc_frames(frames).ok_or(VirtioError::OutOfMemory)?;
        // SAFETY: freshly allocated, zeroed, contiguous, identity-mapped
        let vq = unsafe { Virtqueue::new(phys.as_u64() as *mut u8, phys, size) };

        if self.version == 1 {
            self.regs.write32(regs::GUEST_PAGE_SIZE, lumen_common::PAGE_SIZE as u32);
            self.regs.write32(regs::QUEUE_ALIGN, lumen_common::PAGE_SIZE as u32);
            self.regs.write32(regs::QUEUE_PFN, vq.pfn());
        } else {
            let (desc, avail, used) = vq.ring_addresses();
            self.regs.write32(regs::QUEUE_DESC_LOW, desc as u32);
            self.regs.write32(regs::QUEUE_DESC_HIGH, (desc >> 32) as u32);
            self.regs.write32(regs::QUEUE_AVAIL_LOW, avail as u32);
            self.regs.write32(regs::QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
            self.regs.write32(regs::QUEUE_USED_LOW, used as u32);
            self.regs.write32(regs::QUEUE_USED_HIGH, (used >> 32) as u32);
            self.regs.write32(regs::QUEUE_READY, 1);
        }

        Ok(vq)
    }

    /// Set DRIVER_OK: the device is live.
    pub fn finish_init(&self) {
        let st = self.regs.read32(regs::STATUS) | status::DRIVER_OK;
        self.regs.write32(regs::STATUS, st);
    }

    /// Kick the device for a queue with new available buffers.
    pub fn notify(&self, queue_index: u32) {
        self.regs.write32(regs::QUEUE_NOTIFY, queue_index);
    }

    /// Read and acknowledge pending interrupt causes. Returns the raw
    /// status (0 means the interrupt was not ours).
    pub fn ack_interrupt(&self) -> u32 {
        let st = self.regs.read32(regs::INTERRUPT_STATUS);
        if st != 0 {
            self.regs.write32(regs::INTERRUPT_ACK, st);
        }
        st
    }

    /// Read a 32-bit word from device-specific config space.
    #[must_use]
    pub fn config_read32(&self, offset: usize) -> u32 {
        self.regs.read32(regs::CONFIG + offset)
    }

    /// Read a 64-bit value from device-specific config space.
    #[must_use]
    pub fn config_read64(&self, offset: usize) -> u64 {
        self.regs.read64_split(regs::CONFIG + offset)
    }
}
