//! PL011 UART Console
//!
//! Early character output for the kernel log and panic path, plus
//! non-blocking receive used by the UART interrupt to feed the keyboard
//! buffer. Character I/O on an opened descriptor is handled elsewhere;
//! this is the kernel-side sink only.

use core::fmt;

use lumen_common::layout::dev;
use lumen_mmio::MmioRegion;

/// Data register.
const DR: usize = 0x00;
/// Flag register.
const FR: usize = 0x18;
/// Interrupt mask set/clear register.
const IMSC: usize = 0x38;
/// Interrupt clear register.
const ICR: usize = 0x44;

/// Flag: transmit FIFO full.
const FR_TXFF: u32 = 1 << 5;
/// Flag: receive FIFO empty.
const FR_RXFE: u32 = 1 << 4;
/// Interrupt: receive.
const IMSC_RXIM: u32 = 1 << 4;

fn regs() -> MmioRegion {
    // SAFETY: The PL011 window is part of the identity-mapped MMIO
    // aperture on this platform.
    unsafe { MmioRegion::new(dev::UART_BASE as usize, 0x1000) }
}

/// Unmask the receive interrupt so typed characters arrive via IRQ 33.
pub fn enable_rx_irq() {
    let uart = regs();
    uart.write32(ICR, 0x7FF);
    uart.write32(IMSC, IMSC_RXIM);
}

/// Acknowledge a pending UART interrupt.
pub fn clear_irq() {
    regs().write32(ICR, 0x7FF);
}

/// Blocking write of one byte.
pub fn putc(byte: u8) {
    let uart = regs();
    while uart.read32(FR) & FR_TXFF != 0 {
        core::hint::spin_loop();
    }
    uart.write32(DR, byte as u32);
}

/// Non-blocking read of one byte.
#[must_use]
pub fn getc_nonblock() -> Option<u8> {
    let uart = regs();
    if uart.read32(FR) & FR_RXFE != 0 {
        None
    } else {
        Some((uart.read32(DR) & 0xFF) as u8)
    }
}

/// Write a string, expanding `\n` to `\r\n`.
pub fn puts(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            putc(b'\r');
        }
        putc(byte);
    }
}

/// `fmt::Write` sink over the console.
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}
