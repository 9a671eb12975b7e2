//! VirtIO GPU Driver
//!
//! Brings up a single 800x600 BGRA scanout: discover the display,
//! create a 2D host resource, attach the guest backing store, bind the
//! scanout, and expose `flush` (transfer-to-host + resource-flush) for
//! the compositor. Every command is one request/response descriptor
//! pair, completed by busy-wait.

use lumen_arch::IrqSpinMutex;
use lumen_common::{PAGE_SIZE, PhysAddr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::virtio::{VirtioError, VirtioMmio, device_id};
use super::virtqueue::Virtqueue;
use crate::memory::zones;

/// Display width in pixels.
pub const WIDTH: u32 = 800;
/// Display height in pixels.
pub const HEIGHT: u32 = 600;

const QUEUE_SIZE: u16 = 16;

/// Control command and response types.
mod cmd {
    pub const GET_DISPLAY_INFO: u32 = 0x0100;
    pub const RESOURCE_CREATE_2D: u32 = 0x0101;
    pub const SET_SCANOUT: u32 = 0x0103;
    pub const RESOURCE_FLUSH: u32 = 0x0104;
    pub const TRANSFER_TO_HOST_2D: u32 = 0x0105;
    pub const RESOURCE_ATTACH_BACKING: u32 = 0x0106;
    pub const RESP_OK_NODATA: u32 = 0x1100;
    pub const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
}

/// B8G8R8A8: byte order B,G,R,A matches little-endian ARGB8888 words.
const FORMAT_B8G8R8A8_UNORM: u32 = 1;

/// The scanout resource id.
const RESOURCE_ID: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CtrlHeader {
    type_: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct GpuRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ResourceCreate2d {
    hdr: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ResourceAttachBacking {
    hdr: CtrlHeader,
    resource_id: u32,
    nr_entries: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct MemEntry {
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SetScanout {
    hdr: CtrlHeader,
    r: GpuRect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct TransferToHost2d {
    hdr: CtrlHeader,
    r: GpuRect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ResourceFlush {
    hdr: CtrlHeader,
    r: GpuRect,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DisplayOne {
    r: GpuRect,
    enabled: u32,
    flags: u32,
}

struct VirtioGpu {
    dev: VirtioMmio,
    vq: Virtqueue,
    /// One frame each for command and response payloads.
    cmd_dma: PhysAddr,
    resp_dma: PhysAddr,
    /// Guest backing store bound to the scanout resource.
    fb_base: PhysAddr,
}

impl VirtioGpu {
    /// Issue one command/response pair and return the response type.
    fn send(&mut self, cmd_bytes: &[u8], resp_len: u32) -> u32 {
        debug_assert!(cmd_bytes.len() <= PAGE_SIZE);
        // SAFETY: cmd_dma is our private, identity-mapped frame
        unsafe {
            core::ptr::write_bytes(self.cmd_dma.as_u64() as *mut u8, 0, PAGE_SIZE);
            core::ptr::write_bytes(self.resp_dma.as_u64() as *mut u8, 0, PAGE_SIZE);
            core::ptr::copy_nonoverlapping(
                cmd_bytes.as_ptr(),
                self.cmd_dma.as_u64() as *mut u8,
                cmd_bytes.len(),
            );
        }

        let Some(chain) = self.vq.submit(&[
            (self.cmd_dma.as_u64(), cmd_bytes.len() as u32, false),
            (self.resp_dma.as_u64(), resp_len, true),
        ]) else {
            log::error!("virtio-gpu: control queue full");
            return 0;
        };

        self.dev.notify(0);
        self.vq.wait(chain);

        // SAFETY: the device wrote the response before completing
        unsafe { (self.resp_dma.as_u64() as *const u32).read_volatile() }
    }

    fn check(&mut self, what: &str, cmd_bytes: &[u8]) {
        let resp = self.send(cmd_bytes, core::mem::size_of::<CtrlHeader>() as u32);
        if resp != cmd::RESP_OK_NODATA {
            log::warn!("virtio-gpu: {} returned {:#x}", what, resp);
        }
    }

    fn flush_rect(&mut self, x: u32, y: u32, w: u32, h: u32) {
        let rect = GpuRect {
            x,
            y,
            width: w,
            height: h,
        };

        let transfer = TransferToHost2d {
            hdr: CtrlHeader {
                type_: cmd::TRANSFER_TO_HOST_2D,
                ..Default::default()
            },
            r: rect,
            offset: (y as u64 * WIDTH as u64 + x as u64) * 4,
            resource_id: RESOURCE_ID,
            padding: 0,
        };
        self.check("transfer_to_host_2d", transfer.as_bytes());

        let flush = ResourceFlush {
            hdr: CtrlHeader {
                type_: cmd::RESOURCE_FLUSH,
                ..Default::default()
            },
            r: rect,
            resource_id: RESOURCE_ID,
            padding: 0,
        };
        self.check("resource_flush", flush.as_bytes());
    }
}

static GPU: IrqSpinMutex<Option<VirtioGpu>> = IrqSpinMutex::new(None);

/// Probe and bring up the GPU, leaving a bound 800x600 scanout backed by
/// guest memory.
pub fn init() {
    for slot in 0..lumen_common::layout::dev::VIRTIO_SLOTS {
        let Some(dev) = VirtioMmio::probe(slot, device_id::GPU) else {
            continue;
        };
        log::info!("virtio-gpu: device in slot {}", slot);
        match bring_up(dev) {
            Ok(gpu) => *GPU.lock() = Some(gpu),
            Err(err) => log::error!("virtio-gpu: init failed: {:?}", err),
        }
        return;
    }
    log::warn!("virtio-gpu: no device found");
}

fn bring_up(dev: VirtioMmio) -> Result<VirtioGpu, VirtioError> {
    dev.begin_init()?;
    let vq = dev.setup_queue(0, QUEUE_SIZE)?;
    dev.finish_init();

    let cmd_dma = zones::alloc_frame().ok_or(VirtioError::OutOfMemory)?;
    let resp_dma = zones::alloc_frame().ok_or(VirtioError::OutOfMemory)?;

    let fb_bytes = (WIDTH * HEIGHT * 4) as usize;
    let fb_base = zones::alloc_frames(fb_bytes.div_ceil(PAGE_SIZE)).ok_or(VirtioError::OutOfMemory)?;

    let mut gpu = VirtioGpu {
        dev,
        vq,
        cmd_dma,
        resp_dma,
        fb_base,
    };

    // Discover the display mode; we drive display 0 at the fixed mode
    // regardless, but the answer is worth logging.
    let info = CtrlHeader {
        type_: cmd::GET_DISPLAY_INFO,
        ..Default::default()
    };
    let resp_len = (core::mem::size_of::<CtrlHeader>() + 16 * core::mem::size_of::<DisplayOne>()) as u32;
    let resp = gpu.send(info.as_bytes(), resp_len);
    if resp == cmd::RESP_OK_DISPLAY_INFO {
        // SAFETY: the device filled the response frame
        let first = unsafe {
            ((gpu.resp_dma.as_u64() as usize + core::mem::size_of::<CtrlHeader>())
                as *const DisplayOne)
                .read_volatile()
        };
        log::info!(
            "virtio-gpu: display 0 reports {}x{} enabled={}",
            first.r.width,
            first.r.height,
            first.enabled
        );
    }

    let create = ResourceCreate2d {
        hdr: CtrlHeader {
            type_: cmd::RESOURCE_CREATE_2D,
            ..Default::default()
        },
        resource_id: RESOURCE_ID,
        format: FORMAT_B8G8R8A8_UNORM,
        width: WIDTH,
        height: HEIGHT,
    };
    gpu.check("resource_create_2d", create.as_bytes());

    // Attach command carries one trailing memory entry.
    let attach = ResourceAttachBacking {
        hdr: CtrlHeader {
            type_: cmd::RESOURCE_ATTACH_BACKING,
            ..Default::default()
        },
        resource_id: RESOURCE_ID,
        nr_entries: 1,
    };
    let entry = MemEntry {
        addr: fb_base.as_u64(),
        length: fb_bytes as u32,
        padding: 0,
    };
    let mut attach_buf = [0u8; core::mem::size_of::<ResourceAttachBacking>() + core::mem::size_of::<MemEntry>()];
    attach_buf[..core::mem::size_of::<ResourceAttachBacking>()].copy_from_slice(attach.as_bytes());
    attach_buf[core::mem::size_of::<ResourceAttachBacking>()..].copy_from_slice(entry.as_bytes());
    gpu.check("resource_attach_backing", &attach_buf);

    let scanout = SetScanout {
        hdr: CtrlHeader {
            type_: cmd::SET_SCANOUT,
            ..Default::default()
        },
        r: GpuRect {
            x: 0,
            y: 0,
            width: WIDTH,
            height: HEIGHT,
        },
        scanout_id: 0,
        resource_id: RESOURCE_ID,
    };
    gpu.check("set_scanout", scanout.as_bytes());

    gpu.flush_rect(0, 0, WIDTH, HEIGHT);

    log::info!(
        "virtio-gpu: {}x{} scanout, backing at {:#x}",
        WIDTH,
        HEIGHT,
        fb_base.as_u64()
    );
    Ok(gpu)
}

/// Physical base of the framebuffer backing store.
#[must_use]
pub fn framebuffer() -> Option<PhysAddr> {
    GPU.lock().as_ref().map(|g| g.fb_base)
}

/// Push a dirty rectangle of the backing store to the host and commit
/// it to the screen.
pub fn flush(x: u32, y: u32, w: u32, h: u32) {
    if let Some(gpu) = GPU.lock().as_mut() {
        gpu.flush_rect(x, y, w, h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_layouts() {
        assert_eq!(core::mem::size_of::<CtrlHeader>(), 24);
        assert_eq!(core::mem::size_of::<GpuRect>(), 16);
        assert_eq!(core::mem::size_of::<ResourceCreate2d>(), 40);
        assert_eq!(core::mem::size_of::<SetScanout>(), 48);
        assert_eq!(core::mem::size_of::<TransferToHost2d>(), 56);
        assert_eq!(core::mem::size_of::<ResourceFlush>(), 48);
        assert_eq!(core::mem::size_of::<MemEntry>(), 16);
    }

    #[test]
    fn test_transfer_offset_is_row_major() {
        let t = TransferToHost2d {
            hdr: CtrlHeader {
                type_: cmd::TRANSFER_TO_HOST_2D,
                ..Default::default()
            },
            r: GpuRect {
                x: 10,
                y: 2,
                width: 1,
                height: 1,
            },
            offset: (2 * WIDTH as u64 + 10) * 4,
            resource_id: RESOURCE_ID,
            padding: 0,
        };
        assert_eq!(t.offset, (2 * 800 + 10) * 4);
    }
}
