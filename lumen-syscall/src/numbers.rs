//! Syscall numbers
//!
//! I/O, time, and process identity follow the 64-bit ARM Linux numbers;
//! the window operations occupy a private band from 200 up.

/// Syscall numbers recognized by the dispatcher.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Read from a file descriptor (only fd 0, the keyboard).
    Read = 63,
    /// Write to a file descriptor (fd 1/2: caller's window or console).
    Write = 64,
    /// Terminate the calling process. Does not return.
    Exit = 93,
    /// Monotonic tick count since boot.
    GetTime = 169,
    /// Caller's process identifier.
    GetPid = 172,
    /// Fill a rectangle in the caller's window, or the bare framebuffer
    /// if the caller owns no window.
    Draw = 200,
    /// Request a compositor re-render.
    Flush = 201,
    /// Create a window; returns the new window id.
    CreateWindow = 210,
    /// Fill a rectangle in a named window, subject to ownership.
    WindowDraw = 211,
    /// Force an immediate compositor re-render.
    CompositorRender = 212,
}

impl Syscall {
    /// Decode a raw syscall number.
    #[must_use]
    pub fn from_number(num: u64) -> Option<Self> {
        Some(match num {
            63 => Self::Read,
            64 => Self::Write,
            93 => Self::Exit,
            169 => Self::GetTime,
            172 => Self::GetPid,
            200 => Self::Draw,
            201 => Self::Flush,
            210 => Self::CreateWindow,
            211 => Self::WindowDraw,
            212 => Self::CompositorRender,
            _ => return None,
        })
    }

    /// Name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exit => "exit",
            Self::GetTime => "get_time",
            Self::GetPid => "getpid",
            Self::Draw => "draw",
            Self::Flush => "flush",
            Self::CreateWindow => "create_window",
            Self::WindowDraw => "window_draw",
            Self::CompositorRender => "compositor_render",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_number_roundtrip() {
        for sc in [
            Syscall::Read,
            Syscall::Write,
            Syscall::Exit,
            Syscall::GetTime,
            Syscall::GetPid,
            Syscall::Draw,
            Syscall::Flush,
            Syscall::CreateWindow,
            Syscall::WindowDraw,
            Syscall::CompositorRender,
        ] {
            assert_eq!(Syscall::from_number(sc as u64), Some(sc));
        }
    }

    #[test]
    fn test_unknown_numbers_rejected() {
        assert_eq!(Syscall::from_number(0), None);
        assert_eq!(Syscall::from_number(65), None);
        assert_eq!(Syscall::from_number(213), None);
        assert_eq!(Syscall::from_number(u64::MAX), None);
    }
}
