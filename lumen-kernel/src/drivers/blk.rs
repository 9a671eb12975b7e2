//! VirtIO Block Driver
//!
//! Synchronous, single-issue sector I/O. Each request is a three-
//! descriptor chain: header (device reads), data, one status byte
//! (device writes); completion is busy-waited on the used ring. The
//! driver lock serialises concurrent callers.

use lumen_arch::IrqSpinMutex;
use lumen_common::PhysAddr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::virtio::{VirtioMmio, VirtioError, device_id};
use super::virtqueue::Virtqueue;
use crate::memory::zones;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Ring size for the request queue.
const QUEUE_SIZE: u16 = 16;

/// Request types.
mod req_type {
    /// Read from the device.
    pub const IN: u32 = 0;
    /// Write to the device.
    pub const OUT: u32 = 1;
}

/// Completion status written by the device.
mod req_status {
    pub const OK: u8 = 0;
}

/// Request header, little-endian on the wire.
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct BlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// Byte offset of the status byte within the DMA frame (header first).
const STATUS_OFFSET: usize = core::mem::size_of::<BlkReqHeader>();

/// Errors from block I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkError {
    /// No device was probed.
    NoDevice,
    /// Buffer length is not a whole number of sectors.
    BadLength,
    /// The device reported failure.
    Io,
    /// Ring descriptors exhausted.
    QueueFull,
}

struct VirtioBlk {
    dev: VirtioMmio,
    vq: Virtqueue,
    /// One frame holding the request header and status byte, at a
    /// stable physical address for the descriptor chain.
    dma: PhysAddr,
    capacity_sectors: u64,
}

impl VirtioBlk {
    fn request(&mut self, sector: u64, buf_phys: u64, len: u32, write: bool) -> Result<(), BlkError> {
        let header = BlkReqHeader {
            type_: if write { req_type::OUT } else { req_type::IN },
            reserved: 0,
            sector,
        };
        // SAFETY: dma is our private, identity-mapped frame
        unsafe {
            core::ptr::copy_nonoverlapping(
                header.as_bytes().as_ptr(),
                self.dma.as_u64() as *mut u8,
                core::mem::size_of::<BlkReqHeader>(),
            );
            ((self.dma.as_u64() as usize + STATUS_OFFSET) as *mut u8).write_volatile(0xFF);
        }

        let chain = self
            .vq
            .submit(&[
                (self.dma.as_u64(), core::mem::size_of::<BlkReqHeader>() as u32, false),
                (buf_phys, len, !write),
                (self.dma.as_u64() + STATUS_OFFSET as u64, 1, true),
            ])
            .ok_or(BlkError::QueueFull)?;

        self.dev.notify(0);
        self.vq.wait(chain);

        // SAFETY: the device wrote the status byte before the used ring
        // advanced
        let status = unsafe {
            ((self.dma.as_u64() as usize + STATUS_OFFSET) as *const u8).read_volatile()
        };
        if status != req_status::OK {
            log::error!("virtio-blk: request failed, status {}", status);
            return Err(BlkError::Io);
        }
        Ok(())
    }
}

static BLK: IrqSpinMutex<Option<VirtioBlk>> = IrqSpinMutex::new(None);

/// Probe the MMIO band for a block device and bring it up.
pub fn init() {
    for slot in 0..lumen_common::layout::dev::VIRTIO_SLOTS {
        let Some(dev) = VirtioMmio::probe(slot, device_id::BLOCK) else {
            continue;
        };
        log::info!(
            "virtio-blk: device in slot {} (version {})",
            slot,
            dev.version()
        );
        match bring_up(dev) {
            Ok(blk) => {
                log::info!(
                    "virtio-blk: {} MiB capacity",
                    blk.capacity_sectors * SECTOR_SIZE as u64 / (1024 * 1024)
                );
                *BLK.lock() = Some(blk);
            }
            Err(err) => log::error!("virtio-blk: init failed: {:?}", err),
        }
        return;
    }
    log::warn!("virtio-blk: no device found");
}

fn bring_up(dev: VirtioMmio) -> Result<VirtioBlk, VirtioError> {
    dev.begin_init()?;
    let vq = dev.setup_queue(0, QUEUE_SIZE)?;
    dev.finish_init();

    let dma = zones::alloc_frame().ok_or(VirtioError::OutOfMemory)?;
    let capacity_sectors = dev.config_read64(0);

    Ok(VirtioBlk {
        dev,
        vq,
        dma,
        capacity_sectors,
    })
}

/// Read whole sectors into `buf` (length must be a sector multiple).
/// The buffer must be physically contiguous; everything from the frame
/// allocator or the kernel heap qualifies.
pub fn read(sector: u64, buf: &mut [u8]) -> Result<(), BlkError> {
    if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
        return Err(BlkError::BadLength);
    }
    let mut guard = BLK.lock();
    let blk = guard.as_mut().ok_or(BlkError::NoDevice)?;
    blk.request(sector, buf.as_mut_ptr() as u64, buf.len() as u32, false)
}

/// Write whole sectors from `buf`.
pub fn write(sector: u64, buf: &[u8]) -> Result<(), BlkError> {
    if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
        return Err(BlkError::BadLength);
    }
    let mut guard = BLK.lock();
    let blk = guard.as_mut().ok_or(BlkError::NoDevice)?;
    blk.request(sector, buf.as_ptr() as u64, buf.len() as u32, true)
}

/// Device capacity in sectors, if a device is present.
#[must_use]
pub fn capacity_sectors() -> Option<u64> {
    BLK.lock().as_ref().map(|b| b.capacity_sectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::size_of::<BlkReqHeader>(), 16);
        let header = BlkReqHeader {
            type_: req_type::IN,
            reserved: 0,
            sector: 0x1122_3344_5566_7788,
        };
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        // Sector is little-endian at offset 8.
        assert_eq!(&bytes[8..16], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    }
}
