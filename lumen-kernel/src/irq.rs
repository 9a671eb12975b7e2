//! GICv2 Interrupt Controller
//!
//! Distributor + per-hart CPU interface bring-up, line control, and the
//! top-level IRQ dispatch loop. Known line kinds are dispatched through
//! [`IrqSource`]; anything else goes to the registered-handler table.

use lumen_arch::IrqSpinMutex;
use lumen_arch::exceptions::TrapFrame;
use lumen_common::layout::{dev, irq as lines};
use lumen_mmio::MmioRegion;

/// Highest line number tracked (GICv2 architectural limit is 1020).
pub const MAX_IRQS: usize = 256;

/// First shared peripheral interrupt.
const SPI_START: u32 = 32;

/// IAR values at or above this are spurious.
const SPURIOUS: u32 = 1020;

/// Distributor register offsets.
mod gicd {
    pub const CTLR: usize = 0x000;
    pub const TYPER: usize = 0x004;
    pub const ISENABLER: usize = 0x100;
    pub const ICENABLER: usize = 0x180;
    pub const ICPENDR: usize = 0x280;
    pub const IPRIORITYR: usize = 0x400;
    pub const ITARGETSR: usize = 0x800;
    pub const ICFGR: usize = 0xC00;
    pub const SGIR: usize = 0xF00;
}

/// CPU interface register offsets.
mod gicc {
    pub const CTLR: usize = 0x000;
    pub const PMR: usize = 0x004;
    pub const BPR: usize = 0x008;
    pub const IAR: usize = 0x00C;
    pub const EOIR: usize = 0x010;
}

fn dist() -> MmioRegion {
    // SAFETY: GICD is inside the identity-mapped MMIO aperture
    unsafe { MmioRegion::new(dev::GICD_BASE as usize, 0x1000) }
}

fn cpu() -> MmioRegion {
    // SAFETY: GICC is inside the identity-mapped MMIO aperture
    unsafe { MmioRegion::new(dev::GICC_BASE as usize, 0x1000) }
}

/// Registered fallback handler: callback plus opaque data word.
pub type IrqHandler = fn(intid: u32, data: usize);

static HANDLERS: IrqSpinMutex<[Option<(IrqHandler, usize)>; MAX_IRQS]> =
    IrqSpinMutex::new([None; MAX_IRQS]);

static NUM_IRQS: IrqSpinMutex<u32> = IrqSpinMutex::new(0);

/// Known interrupt sources, matched in [`dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// The periodic EL1 virtual timer; its handler may swap the frame.
    Timer,
    /// PL011 receive.
    Uart,
    /// A VirtIO input device, by slot index within the MMIO band.
    VirtioInput { slot: u8 },
    /// Anything else: look up the registered-handler table.
    Other,
}

/// Classify a line number.
#[must_use]
pub fn classify(intid: u32) -> IrqSource {
    match intid {
        lines::TIMER_VIRT => IrqSource::Timer,
        lines::UART => IrqSource::Uart,
        n if n >= lines::VIRTIO_BASE && n < lines::VIRTIO_BASE + dev::VIRTIO_SLOTS as u32 => {
            IrqSource::VirtioInput {
                slot: (n - lines::VIRTIO_BASE) as u8,
            }
        }
        _ => IrqSource::Other,
    }
}

/// Initialize the distributor. Runs once on the boot hart.
pub fn init() {
    let d = dist();

    d.write32(gicd::CTLR, 0);

    let typer = d.read32(gicd::TYPER);
    let mut num_irqs = ((typer & 0x1F) + 1) * 32;
    if num_irqs > MAX_IRQS as u32 {
        num_irqs = MAX_IRQS as u32;
    }
    *NUM_IRQS.lock() = num_irqs;

    // Mask everything, clear anything pending.
    for i in 0..(num_irqs / 32) as usize {
        d.write32(gicd::ICENABLER + i * 4, 0xFFFF_FFFF);
        d.write32(gicd::ICPENDR + i * 4, 0xFFFF_FFFF);
    }

    // Middle priority for all SPIs, routed to hart 0, level-triggered.
    for i in (SPI_START / 4) as usize..(num_irqs / 4) as usize {
        d.write32(gicd::IPRIORITYR + i * 4, 0xA0A0_A0A0);
        d.write32(gicd::ITARGETSR + i * 4, 0x0101_0101);
    }
    for i in 2..(num_irqs / 16) as usize {
        d.write32(gicd::ICFGR + i * 4, 0);
    }

    d.write32(gicd::CTLR, 1);

    log::info!("gic: distributor up, {} lines", num_irqs);
}

/// Initialize the CPU interface. Runs on each hart.
pub fn init_percpu() {
    let d = dist();
    let c = cpu();

    // Mask banked SGIs/PPIs and give them the middle priority.
    d.write32(gicd::ICENABLER, 0xFFFF_FFFF);
    for i in 0..(SPI_START / 4) as usize {
        d.write32(gicd::IPRIORITYR + i * 4, 0xA0A0_A0A0);
    }

    c.write32(gicc::PMR, 0xFF);
    c.write32(gicc::BPR, 0);
    c.write32(gicc::CTLR, 1);
}

/// Enable an interrupt line.
pub fn enable(intid: u32) {
    if (intid as usize) < MAX_IRQS {
        dist().write32(gicd::ISENABLER + (intid / 32) as usize * 4, 1 << (intid % 32));
    }
}

/// Disable an interrupt line.
pub fn disable(intid: u32) {
    if (intid as usize) < MAX_IRQS {
        dist().write32(gicd::ICENABLER + (intid / 32) as usize * 4, 1 << (intid % 32));
    }
}

/// Set a line's priority (0 = highest).
pub fn set_priority(intid: u32, priority: u8) {
    if (intid as usize) >= MAX_IRQS {
        return;
    }
    let d = dist();
    let reg = gicd::IPRIORITYR + (intid / 4) as usize * 4;
    let shift = (intid % 4) * 8;
    let mut val = d.read32(reg);
    val &= !(0xFF << shift);
    val |= (priority as u32) << shift;
    d.write32(reg, val);
}

/// Route a shared line to a set of harts.
pub fn set_target(intid: u32, cpu_mask: u8) {
    if intid < SPI_START || (intid as usize) >= MAX_IRQS {
        return;
    }
    let d = dist();
    let reg = gicd::ITARGETSR + (intid / 4) as usize * 4;
    let shift = (intid % 4) * 8;
    let mut val = d.read32(reg);
    val &= !(0xFF << shift);
    val |= (cpu_mask as u32) << shift;
    d.write32(reg, val);
}

/// Raise a software-generated interrupt on the harts in `target_mask`.
pub fn send_sgi(intid: u32, target_mask: u8) {
    if intid > 15 {
        return;
    }
    dist().write32(gicd::SGIR, ((target_mask as u32) << 16) | intid);
}

/// Read the interrupt-acknowledge register. `None` means spurious.
#[must_use]
fn acknowledge() -> Option<u32> {
    let intid = cpu().read32(gicc::IAR) & 0x3FF;
    if intid >= SPURIOUS { None } else { Some(intid) }
}

/// Signal end of interrupt.
fn end(intid: u32) {
    cpu().write32(gicc::EOIR, intid);
}

/// Register a fallback handler for a line and enable it.
pub fn register_handler(intid: u32, handler: IrqHandler, data: usize) {
    if (intid as usize) >= MAX_IRQS {
        log::warn!("gic: handler for line {} out of range", intid);
        return;
    }
    HANDLERS.lock()[intid as usize] = Some((handler, data));
    enable(intid);
}

/// Remove a fallback handler and mask the line.
pub fn unregister_handler(intid: u32) {
    if (intid as usize) < MAX_IRQS {
        disable(intid);
        HANDLERS.lock()[intid as usize] = None;
    }
}

/// Top-level IRQ dispatch, called from the exception vector.
///
/// Drains pending interrupts until acknowledge reads spurious. The timer
/// hook may return a different register frame; that frame is what the
/// vector epilogue restores.
pub fn dispatch(frame: *mut TrapFrame) -> *mut TrapFrame {
    let mut ret = frame;

    while let Some(intid) = acknowledge() {
        match classify(intid) {
            IrqSource::Timer => {
                ret = crate::time::handle_tick(ret);
            }
            IrqSource::Uart => {
                crate::console::clear_irq();
                while let Some(byte) = crate::console::getc_nonblock() {
                    crate::keyboard::push_char(byte);
                }
            }
            IrqSource::VirtioInput { slot } => {
                crate::drivers::input::handle_irq(slot);
            }
            IrqSource::Other => {
                let handler = HANDLERS.lock()[intid as usize];
                match handler {
                    Some((callback, data)) => callback(intid, data),
                    None => log::warn!("gic: unhandled IRQ {}", intid),
                }
            }
        }
        end(intid);
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_lines() {
        assert_eq!(classify(27), IrqSource::Timer);
        assert_eq!(classify(33), IrqSource::Uart);
        assert_eq!(classify(48), IrqSource::VirtioInput { slot: 0 });
        assert_eq!(classify(51), IrqSource::VirtioInput { slot: 3 });
        assert_eq!(classify(48 + 31), IrqSource::VirtioInput { slot: 31 });
    }

    #[test]
    fn test_classify_fallback() {
        assert_eq!(classify(0), IrqSource::Other);
        assert_eq!(classify(34), IrqSource::Other);
        assert_eq!(classify(48 + 32), IrqSource::Other);
    }
}
