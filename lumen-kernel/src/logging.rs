//! Kernel Logging
//!
//! `log` crate facade over the UART console. Records are formatted into
//! a stack buffer (no allocation, so logging works before the heap and
//! inside interrupt handlers) and written with a jiffies timestamp and
//! ANSI level colouring.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::console;
use crate::time;

const MESSAGE_CAP: usize = 256;

/// Fixed-size formatting buffer.
struct MessageBuffer {
    data: [u8; MESSAGE_CAP],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0; MESSAGE_CAP],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(MESSAGE_CAP - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_str = match record.level() {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33m WARN\x1b[0m",
            Level::Info => "\x1b[32m INFO\x1b[0m",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        };

        let ticks = time::jiffies();
        let mut buf = MessageBuffer::new();
        let _ = writeln!(
            buf,
            "[{:>6}.{:02}] {} {}: {}",
            ticks / lumen_common::layout::HZ,
            ticks % lumen_common::layout::HZ,
            level_str,
            record.target(),
            record.args()
        );
        console::puts(buf.as_str());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Info))
        .ok();
}
