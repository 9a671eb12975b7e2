//! Supervisor-Call Dispatcher
//!
//! Decodes the syscall number from x8 and arguments from x0-x5, executes
//! the operation, and writes the result back into x0 of the saved frame.
//! Interrupts are re-enabled on entry so user I/O can block on the timer
//! and device interrupts.

use lumen_arch::cpu;
use lumen_arch::exceptions::TrapFrame;
use lumen_syscall::{ERR_SENTINEL, Syscall};

use crate::compositor;
use crate::keyboard;
use crate::task;
use crate::time;
use crate::trap;

/// Longest accepted window title, bytes.
const TITLE_CAP: usize = 63;

/// Handle an SVC from EL0. Returns the frame to resume (always the
/// caller's own frame; exit diverges instead).
pub fn handle(frame: *mut TrapFrame) -> *mut TrapFrame {
    cpu::enable_interrupts();

    // SAFETY: The vector stub passes the frame it just stacked
    let f = unsafe { &mut *frame };
    let num = f.gpr[8];
    let args = [f.gpr[0], f.gpr[1], f.gpr[2], f.gpr[3], f.gpr[4], f.gpr[5]];

    let result = match Syscall::from_number(num) {
        Some(Syscall::Read) => sys_read(args[0] as i32, args[1], args[2] as usize),
        Some(Syscall::Write) => sys_write(args[0] as i32, args[1], args[2] as usize),
        Some(Syscall::Exit) => sys_exit(args[0] as i32),
        Some(Syscall::GetTime) => time::jiffies() as i64,
        Some(Syscall::GetPid) => task::current_pid().map_or(0, i64::from),
        Some(Syscall::Draw) => sys_draw(
            args[0] as i32,
            args[1] as i32,
            args[2] as u32,
            args[3] as u32,
            args[4] as u32,
        ),
        Some(Syscall::Flush) => {
            compositor::flush();
            0
        }
        Some(Syscall::CreateWindow) => sys_create_window(
            args[0] as i32,
            args[1] as i32,
            args[2] as u32,
            args[3] as u32,
            args[4],
        ),
        Some(Syscall::WindowDraw) => sys_window_draw(
            args[0] as i64,
            args[1] as i32,
            args[2] as i32,
            args[3] as u32,
            args[4] as u32,
            args[5] as u32,
        ),
        Some(Syscall::CompositorRender) => {
            compositor::render();
            0
        }
        None => {
            log::warn!("syscall: unknown number {}", num);
            ERR_SENTINEL
        }
    };

    f.gpr[0] = result as u64;
    frame
}

/// Read one keyboard character. Only fd 0 is honoured; the read blocks
/// on `wfe` while the caller holds input focus and the buffer is empty,
/// and returns 0 immediately when the caller is not focused.
fn sys_read(fd: i32, buf: u64, count: usize) -> i64 {
    if fd != 0 || count == 0 || buf == 0 {
        return 0;
    }
    let pid = task::current_pid().unwrap_or(0);

    loop {
        if compositor::focus_pid() != Some(pid) {
            return 0;
        }
        if let Some(byte) = keyboard::pop_char() {
            // SAFETY: buf is a user address in the caller's live address
            // space, which is installed while the caller runs.
            unsafe {
                (buf as *mut u8).write(byte);
            }
            return 1;
        }
        // Any IRQ (next key, next tick) wakes the hart; retry then.
        cpu::wait_for_event();
    }
}

/// Write to stdout/stderr: the caller's window when it has one, the
/// console otherwise.
fn sys_write(fd: i32, buf: u64, count: usize) -> i64 {
    if buf == 0 || count == 0 {
        return 0;
    }
    // SAFETY: buf..buf+count is user memory in the caller's live
    // address space.
    let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, count) };

    if fd == 1 || fd == 2 {
        let pid = task::current_pid().unwrap_or(0);
        if let Some(win) = compositor::window_for_pid(pid) {
            compositor::window_write(win, bytes);
            return count as i64;
        }
    }

    for &byte in bytes {
        if byte == b'\n' {
            crate::console::putc(b'\r');
        }
        crate::console::putc(byte);
    }
    count as i64
}

/// Park the caller forever. Diverges.
fn sys_exit(status: i32) -> i64 {
    task::exit_current(status);
    trap::park_current()
}

/// Fill a rectangle: in the caller's window when it has one, else
/// straight into the backbuffer (the init splash path).
fn sys_draw(x: i32, y: i32, w: u32, h: u32, color: u32) -> i64 {
    let pid = task::current_pid().unwrap_or(0);
    match compositor::window_for_pid(pid) {
        Some(win) => {
            compositor::draw_rect(win, x, y, w, h, color, pid);
        }
        None => compositor::fill_screen_rect(x, y, w, h, color),
    }
    0
}

fn sys_create_window(x: i32, y: i32, w: u32, h: u32, title_ptr: u64) -> i64 {
    let pid = task::current_pid().unwrap_or(0);
    let mut title = [0u8; TITLE_CAP];
    let mut len = 0;
    if title_ptr != 0 {
        while len < TITLE_CAP {
            // SAFETY: NUL-terminated user string in the caller's live
            // address space, read byte by byte up to the cap.
            let byte = unsafe { ((title_ptr + len as u64) as *const u8).read() };
            if byte == 0 {
                break;
            }
            title[len] = byte;
            len += 1;
        }
    }
    let title = core::str::from_utf8(&title[..len]).unwrap_or("?");

    match compositor::create(x, y, w, h, title, pid) {
        Some(id) => id as i64,
        None => ERR_SENTINEL,
    }
}

/// Ownership-checked window fill. Permission failures are silent
/// (logged, no effect) and still return success.
fn sys_window_draw(win_id: i64, x: i32, y: i32, w: u32, h: u32, color: u32) -> i64 {
    let pid = task::current_pid().unwrap_or(0);
    compositor::draw_rect(win_id as u32, x, y, w, h, color, pid);
    0
}
