//! VirtIO Input Driver
//!
//! Keyboard, mouse, and tablet events. Every descriptor in the event
//! queue is pre-posted device-writable; the interrupt handler drains
//! completions, routes each event (motion to the compositor's mouse,
//! left button to its click handler, keys to the keyboard translator),
//! and re-posts the descriptor.

use lumen_arch::IrqSpinMutex;
use lumen_common::PhysAddr;
use lumen_common::layout::{dev, irq as lines};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::virtio::{VirtioMmio, device_id};
use super::virtqueue::{VirtqDesc, Virtqueue, desc_flags};
use crate::compositor;
use crate::keyboard;
use crate::memory::zones;

/// Event queue size; one pre-posted buffer per descriptor.
const QUEUE_SIZE: u16 = 16;

/// Most input devices QEMU will reasonably attach.
const MAX_DEVICES: usize = 2;

/// Linux input event types and codes.
mod ev {
    pub const KEY: u16 = 1;
    pub const REL: u16 = 2;
    pub const ABS: u16 = 3;
    pub const REL_X: u16 = 0;
    pub const REL_Y: u16 = 1;
    pub const ABS_X: u16 = 0;
    pub const ABS_Y: u16 = 1;
    pub const BTN_LEFT: u16 = 0x110;
}

/// Absolute axes report in this range; scaled to the screen.
const ABS_RANGE: i64 = 0x8000;

/// One input event: two-byte type and code, four-byte value.
#[repr(C)]
#[derive(Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct InputEvent {
    type_: u16,
    code: u16,
    value: i32,
}

struct InputDev {
    dev: VirtioMmio,
    vq: Virtqueue,
    /// Frame holding the pre-posted event buffers.
    events: PhysAddr,
    /// Last absolute X seen, so an ABS_Y completes a position.
    last_abs_x: i32,
}

impl InputDev {
    fn event(&self, index: u16) -> InputEvent {
        // SAFETY: events frame is ours; the device wrote the slot before
        // the used ring advanced
        unsafe {
            ((self.events.as_u64() as usize
                + index as usize * core::mem::size_of::<InputEvent>())
                as *const InputEvent)
                .read_volatile()
        }
    }
}

static DEVICES: IrqSpinMutex<[Option<InputDev>; MAX_DEVICES]> =
    IrqSpinMutex::new([const { None }; MAX_DEVICES]);

/// Probe the band for input devices and bring each up with pre-posted
/// event buffers and an enabled interrupt line.
pub fn init() {
    let mut found = 0;
    for slot in 0..dev::VIRTIO_SLOTS {
        if found >= MAX_DEVICES {
            break;
        }
        let Some(mmio) = VirtioMmio::probe(slot, device_id::INPUT) else {
            continue;
        };
        match bring_up(mmio) {
            Ok(device) => {
                let slot_u8 = device.dev.slot() as u8;
                let intid = lines::VIRTIO_BASE + slot_u8 as u32;
                DEVICES.lock()[found] = Some(device);
                found += 1;

                crate::irq::set_priority(intid, 0x80);
                crate::irq::set_target(intid, 1);
                crate::irq::enable(intid);
                log::info!("virtio-input: slot {} on IRQ {}", slot_u8, intid);
            }
            Err(err) => log::error!("virtio-input: slot {} init failed: {:?}", slot, err),
        }
    }
    if found == 0 {
        log::warn!("virtio-input: no devices found");
    }
}

fn bring_up(mmio: VirtioMmio) -> Result<InputDev, super::virtio::VirtioError> {
    mmio.begin_init()?;
    let mut vq = mmio.setup_queue(0, QUEUE_SIZE)?;

    let events = zones::alloc_frame().ok_or(super::virtio::VirtioError::OutOfMemory)?;

    // Pre-post every descriptor as device-writable, one event each.
    for i in 0..QUEUE_SIZE {
        vq.write_desc(
            i,
            VirtqDesc {
                addr: events.as_u64() + i as u64 * core::mem::size_of::<InputEvent>() as u64,
                len: core::mem::size_of::<InputEvent>() as u32,
                flags: desc_flags::WRITE,
                next: 0,
            },
        );
        vq.publish(i);
    }

    mmio.finish_init();
    mmio.notify(0);

    Ok(InputDev {
        dev: mmio,
        vq,
        events,
        last_abs_x: 0,
    })
}

/// Interrupt entry for the slot's line: drain the used ring, route each
/// event, re-post its descriptor, then render once if anything visual
/// changed.
pub fn handle_irq(slot: u8) {
    let mut needs_render = false;

    {
        let mut devices = DEVICES.lock();
        let Some(device) = devices
            .iter_mut()
            .flatten()
            .find(|d| d.dev.slot() as u8 == slot)
        else {
            return;
        };

        if device.dev.ack_interrupt() == 0 {
            return;
        }

        while let Some((id, _len)) = device.vq.pop_used() {
            let event = device.event(id);
            route_event(device, event, &mut needs_render);
            // Hand the descriptor straight back to the device.
            device.vq.publish(id);
        }
    }

    if needs_render {
        compositor::render();
    }
}

fn route_event(device: &mut InputDev, event: InputEvent, needs_render: &mut bool) {
    match (event.type_, event.code) {
        (ev::REL, ev::REL_X) => {
            compositor::update_mouse(event.value, 0, false);
            *needs_render = true;
        }
        (ev::REL, ev::REL_Y) => {
            compositor::update_mouse(0, event.value, false);
            *needs_render = true;
        }
        (ev::ABS, ev::ABS_X) => {
            device.last_abs_x = scale_abs(event.value, compositor::SCREEN_WIDTH);
        }
        (ev::ABS, ev::ABS_Y) => {
            let y = scale_abs(event.value, compositor::SCREEN_HEIGHT);
            compositor::update_mouse(device.last_abs_x, y, true);
            *needs_render = true;
        }
        (ev::KEY, ev::BTN_LEFT) => {
            compositor::handle_click(event.code as i32, event.value);
            *needs_render = true;
        }
        (ev::KEY, code) => {
            keyboard::handle_key_event(code, event.value);
        }
        _ => {}
    }
}

/// Scale a 0..0x8000 absolute coordinate to screen pixels.
fn scale_abs(value: i32, extent: u32) -> i32 {
    ((value as i64).clamp(0, ABS_RANGE - 1) * extent as i64 / ABS_RANGE) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_layout() {
        assert_eq!(core::mem::size_of::<InputEvent>(), 8);
    }

    #[test]
    fn test_abs_scaling() {
        assert_eq!(scale_abs(0, 800), 0);
        assert_eq!(scale_abs(0x4000, 800), 400);
        assert_eq!(scale_abs(0x7FFF, 800), 799);
        // Out-of-range values clamp instead of wrapping.
        assert_eq!(scale_abs(-5, 800), 0);
        assert_eq!(scale_abs(0x9000, 600), 599);
    }
}
