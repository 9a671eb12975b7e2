//! Syscall invocation primitives for user programs
//!
//! Inline-assembly wrappers around the `svc #0` instruction. The number
//! travels in x8, arguments in x0-x5, and the result comes back in x0.

use crate::numbers::Syscall;

/// Raw syscall with 0 arguments.
#[inline]
pub fn syscall0(num: Syscall) -> i64 {
    let ret: i64;
    // SAFETY: svc traps to EL1; the kernel preserves everything but x0
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "svc #0",
            in("x8") num as u64,
            lateout("x0") ret,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = num;
        ret = crate::ERR_SENTINEL;
    }
    ret
}

/// Raw syscall with 1 argument.
#[inline]
pub fn syscall1(num: Syscall, arg0: u64) -> i64 {
    let ret: i64;
    // SAFETY: svc traps to EL1; x0 carries the argument in and result out
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "svc #0",
            in("x8") num as u64,
            inlateout("x0") arg0 as i64 => ret,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (num, arg0);
        ret = crate::ERR_SENTINEL;
    }
    ret
}

/// Raw syscall with 3 arguments.
#[inline]
pub fn syscall3(num: Syscall, arg0: u64, arg1: u64, arg2: u64) -> i64 {
    let ret: i64;
    // SAFETY: svc traps to EL1; x0 carries the argument in and result out
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "svc #0",
            in("x8") num as u64,
            inlateout("x0") arg0 as i64 => ret,
            in("x1") arg1,
            in("x2") arg2,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (num, arg0, arg1, arg2);
        ret = crate::ERR_SENTINEL;
    }
    ret
}

/// Raw syscall with 5 arguments.
#[inline]
pub fn syscall5(num: Syscall, arg0: u64, arg1: u64, arg2: u64, arg3: u64, arg4: u64) -> i64 {
    let ret: i64;
    // SAFETY: svc traps to EL1; x0 carries the argument in and result out
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "svc #0",
            in("x8") num as u64,
            inlateout("x0") arg0 as i64 => ret,
            in("x1") arg1,
            in("x2") arg2,
            in("x3") arg3,
            in("x4") arg4,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (num, arg0, arg1, arg2, arg3, arg4);
        ret = crate::ERR_SENTINEL;
    }
    ret
}

/// Raw syscall with 6 arguments.
#[inline]
pub fn syscall6(
    num: Syscall,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
) -> i64 {
    let ret: i64;
    // SAFETY: svc traps to EL1; x0 carries the argument in and result out
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "svc #0",
            in("x8") num as u64,
            inlateout("x0") arg0 as i64 => ret,
            in("x1") arg1,
            in("x2") arg2,
            in("x3") arg3,
            in("x4") arg4,
            in("x5") arg5,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (num, arg0, arg1, arg2, arg3, arg4, arg5);
        ret = crate::ERR_SENTINEL;
    }
    ret
}

/// Write `buf` to stdout.
#[inline]
pub fn write(buf: &[u8]) -> i64 {
    syscall3(Syscall::Write, 1, buf.as_ptr() as u64, buf.len() as u64)
}

/// Read one byte from the keyboard into `buf`.
#[inline]
pub fn read(buf: &mut [u8]) -> i64 {
    syscall3(Syscall::Read, 0, buf.as_mut_ptr() as u64, buf.len() as u64)
}

/// Terminate the calling process.
#[inline]
pub fn exit(status: i32) -> ! {
    syscall1(Syscall::Exit, status as u64);
    // The kernel parks the process; spin if it ever resumes.
    loop {
        core::hint::spin_loop();
    }
}

/// Monotonic tick count.
#[inline]
pub fn get_time() -> i64 {
    syscall0(Syscall::GetTime)
}

/// Caller's process identifier.
#[inline]
pub fn getpid() -> i64 {
    syscall0(Syscall::GetPid)
}

/// Fill a rectangle (caller's window, or the framebuffer if none).
#[inline]
pub fn draw(x: u32, y: u32, w: u32, h: u32, color: u32) -> i64 {
    syscall5(
        Syscall::Draw,
        x as u64,
        y as u64,
        w as u64,
        h as u64,
        color as u64,
    )
}

/// Make pending drawing visible.
#[inline]
pub fn flush() -> i64 {
    syscall0(Syscall::Flush)
}

/// Create a window; `title` must be NUL-terminated.
#[inline]
pub fn create_window(x: i32, y: i32, w: u32, h: u32, title: &core::ffi::CStr) -> i64 {
    syscall5(
        Syscall::CreateWindow,
        x as u64,
        y as u64,
        w as u64,
        h as u64,
        title.as_ptr() as u64,
    )
}

/// Fill a rectangle in an owned window.
#[inline]
pub fn window_draw(win_id: i64, x: i32, y: i32, w: u32, h: u32, color: u32) -> i64 {
    syscall6(
        Syscall::WindowDraw,
        win_id as u64,
        x as u64,
        y as u64,
        w as u64,
        h as u64,
        color as u64,
    )
}

/// Force an immediate compositor render.
#[inline]
pub fn compositor_render() -> i64 {
    syscall0(Syscall::CompositorRender)
}
