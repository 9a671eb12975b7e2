//! Keyboard Subsystem
//!
//! Translates Linux key codes from the VirtIO input driver (and raw
//! bytes from the UART) into ASCII and buffers them for the read
//! syscall. The ring is single-producer (IRQ side) single-consumer
//! (syscall side); head and tail advance independently on the single
//! hart.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use lumen_arch::IrqSpinMutex;

const BUFFER_SIZE: usize = 256;

/// Key codes we track for modifier state (Linux input conventions).
mod key {
    pub const LEFTCTRL: u16 = 29;
    pub const LEFTSHIFT: u16 = 42;
    pub const RIGHTSHIFT: u16 = 54;
    pub const CAPSLOCK: u16 = 58;
    pub const C: u16 = 46;
    pub const Q: u16 = 16;
    pub const P: u16 = 25;
    pub const A: u16 = 30;
    pub const L: u16 = 38;
    pub const Z: u16 = 44;
    pub const M: u16 = 50;
}

/// Scancode to ASCII, US layout, unshifted.
const PLAIN: [u8; 64] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6', // 0-7
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t', // 8-15
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', // 16-23
    b'o', b'p', b'[', b']', b'\n', 0, b'a', b's', // 24-31
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', // 32-39
    b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v', // 40-47
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', // 48-55
    0, b' ', 0, 0, 0, 0, 0, 0, // 56-63
];

/// Scancode to ASCII, US layout, shifted.
const SHIFTED: [u8; 64] = [
    0, 0, b'!', b'@', b'#', b'$', b'%', b'^', // 0-7
    b'&', b'*', b'(', b')', b'_', b'+', 0x08, b'\t', // 8-15
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', // 16-23
    b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S', // 24-31
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', // 32-39
    b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V', // 40-47
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', // 48-55
    0, b' ', 0, 0, 0, 0, 0, 0, // 56-63
];

/// Modifier tracking and scancode translation.
pub struct KeyboardState {
    shift: bool,
    ctrl: bool,
    caps_lock: bool,
}

impl KeyboardState {
    /// Fresh state, no modifiers held.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shift: false,
            ctrl: false,
            caps_lock: false,
        }
    }

    fn is_letter(code: u16) -> bool {
        (key::Q..=key::P).contains(&code)
            || (key::A..=key::L).contains(&code)
            || (key::Z..=key::M).contains(&code)
    }

    /// Feed one key event (`value`: 0 release, 1 press, 2 repeat).
    /// Returns the ASCII byte produced, if any.
    pub fn translate(&mut self, code: u16, value: i32) -> Option<u8> {
        match code {
            key::LEFTSHIFT | key::RIGHTSHIFT => {
                self.shift = value != 0;
                return None;
            }
            key::LEFTCTRL => {
                self.ctrl = value != 0;
                return None;
            }
            key::CAPSLOCK => {
                if value == 1 {
                    self.caps_lock = !self.caps_lock;
                }
                return None;
            }
            _ => {}
        }

        if value == 0 {
            return None;
        }

        // Ctrl+C produces ETX.
        if self.ctrl && code == key::C {
            return Some(0x03);
        }

        if code as usize >= PLAIN.len() {
            return None;
        }

        let mut use_shift = self.shift;
        if Self::is_letter(code) {
            use_shift ^= self.caps_lock;
        }

        let c = if use_shift {
            SHIFTED[code as usize]
        } else {
            PLAIN[code as usize]
        };
        (c != 0).then_some(c)
    }
}

impl Default for KeyboardState {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-producer single-consumer byte ring.
struct CharRing {
    buf: UnsafeCell<[u8; BUFFER_SIZE]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: One producer (IRQ) and one consumer (syscall) on one hart;
// head and tail are only advanced by their respective sides.
unsafe impl Sync for CharRing {}

impl CharRing {
    const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; BUFFER_SIZE]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn push(&self, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % BUFFER_SIZE;
        if next == self.tail.load(Ordering::Acquire) {
            // Full: drop the newest byte.
            return;
        }
        // SAFETY: The producer owns slot `head` until it publishes it.
        unsafe {
            (*self.buf.get())[head] = byte;
        }
        self.head.store(next, Ordering::Release);
    }

    fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: The consumer owns slot `tail` until it releases it.
        let byte = unsafe { (*self.buf.get())[tail] };
        self.tail.store((tail + 1) % BUFFER_SIZE, Ordering::Release);
        Some(byte)
    }
}

static RING: CharRing = CharRing::new();
static STATE: IrqSpinMutex<KeyboardState> = IrqSpinMutex::new(KeyboardState::new());

/// Feed a key event from the input IRQ path.
pub fn handle_key_event(code: u16, value: i32) {
    let byte = STATE.lock().translate(code, value);
    if let Some(byte) = byte {
        RING.push(byte);
    }
}

/// Push a raw byte (UART receive path).
pub fn push_char(byte: u8) {
    RING.push(byte);
}

/// Take one buffered character, if any.
#[must_use]
pub fn pop_char() -> Option<u8> {
    RING.pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_letters() {
        let mut st = KeyboardState::new();
        assert_eq!(st.translate(key::Q, 1), Some(b'q'));
        assert_eq!(st.translate(key::Q, 0), None);
        assert_eq!(st.translate(57, 1), Some(b' '));
    }

    #[test]
    fn test_shift_symbols_and_letters() {
        let mut st = KeyboardState::new();
        st.translate(key::LEFTSHIFT, 1);
        assert_eq!(st.translate(2, 1), Some(b'!'));
        assert_eq!(st.translate(key::Q, 1), Some(b'Q'));
        st.translate(key::LEFTSHIFT, 0);
        assert_eq!(st.translate(key::Q, 1), Some(b'q'));
    }

    #[test]
    fn test_caps_lock_only_letters() {
        let mut st = KeyboardState::new();
        st.translate(key::CAPSLOCK, 1);
        st.translate(key::CAPSLOCK, 0);
        assert_eq!(st.translate(key::Q, 1), Some(b'Q'));
        // Digits are unaffected by caps lock.
        assert_eq!(st.translate(2, 1), Some(b'1'));
        // Shift inverts caps for letters.
        st.translate(key::LEFTSHIFT, 1);
        assert_eq!(st.translate(key::Q, 1), Some(b'q'));
    }

    #[test]
    fn test_ctrl_c_is_etx() {
        let mut st = KeyboardState::new();
        st.translate(key::LEFTCTRL, 1);
        assert_eq!(st.translate(key::C, 1), Some(0x03));
        st.translate(key::LEFTCTRL, 0);
        assert_eq!(st.translate(key::C, 1), Some(b'c'));
    }

    #[test]
    fn test_ring_order_and_emptiness() {
        let ring = CharRing::new();
        assert_eq!(ring.pop(), None);
        ring.push(b'a');
        ring.push(b'b');
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.pop(), Some(b'b'));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_ring_drops_newest_when_full() {
        let ring = CharRing::new();
        for i in 0..(BUFFER_SIZE as u8) {
            ring.push(i);
        }
        // Capacity is BUFFER_SIZE - 1; the oldest byte survives.
        assert_eq!(ring.pop(), Some(0));
    }
}
