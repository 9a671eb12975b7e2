//! Window Compositor
//!
//! Owns every window's pixel buffer, arbitrates input focus by z-order,
//! runs the per-window terminal emulation, and composites windows over
//! the desktop gradient into a backbuffer that is pushed to the GPU.
//!
//! User code never touches a window buffer directly; it issues window
//! syscalls that land here, and every mutation runs under the
//! interrupt-masking compositor lock.

pub mod surface;
pub mod term;

use alloc::string::String;
use alloc::vec::Vec;

use lumen_arch::IrqSpinMutex;

use crate::drivers::gpu;
use surface::{CELL_H, CELL_W, PixelSurface};
use term::TermState;

/// Screen extent, matching the GPU scanout.
pub const SCREEN_WIDTH: u32 = 800;
/// Screen extent, matching the GPU scanout.
pub const SCREEN_HEIGHT: u32 = 600;

/// Window table capacity.
pub const MAX_WINDOWS: usize = 16;

/// Decoration strip above the client area.
pub const TITLE_BAR_HEIGHT: i32 = 20;
/// Close box edge length.
pub const CLOSE_BUTTON_SIZE: i32 = 16;

/// Default window background.
const WINDOW_BG: u32 = 0xFF17_171A;
/// Title bar fill.
const TITLE_COLOR: u32 = 0xFF18_181B;
/// Window border.
const BORDER_COLOR: u32 = 0xFF27_272A;
/// Close box fill.
const CLOSE_COLOR: u32 = 0xFFCC_4444;

/// The main shell pid; its windows are protected (no close box).
const SHELL_PID: u32 = 2;

/// The init pid, exempt from window ownership checks.
const INIT_PID: u32 = 1;

struct Window {
    id: u32,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    z_order: u32,
    visible: bool,
    owner: u32,
    protected: bool,
    buffer: Vec<u32>,
    bg_color: u32,
    title: String,
    term: TermState,
}

impl Window {
    /// Hit test including the title-bar strip above the client area.
    fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && px < self.x + self.width as i32
            && py >= self.y - TITLE_BAR_HEIGHT
            && py < self.y + self.height as i32
    }

    /// The close box rectangle, inset from the title bar's right edge.
    fn close_box(&self) -> (i32, i32) {
        (
            self.x + self.width as i32 - CLOSE_BUTTON_SIZE - 2,
            self.y - TITLE_BAR_HEIGHT + 2,
        )
    }

    fn in_close_box(&self, px: i32, py: i32) -> bool {
        let (bx, by) = self.close_box();
        px >= bx && px < bx + CLOSE_BUTTON_SIZE && py >= by && py < by + CLOSE_BUTTON_SIZE
    }

    fn in_title_bar(&self, py: i32) -> bool {
        py >= self.y - TITLE_BAR_HEIGHT && py < self.y
    }
}

struct DragState {
    window_id: u32,
    off_x: i32,
    off_y: i32,
}

/// Desktop gradient: dark blue deepening down the screen.
fn gradient_color(y: u32, height: u32) -> u32 {
    let r = 20u32;
    let g = 40 + y * 40 / height.max(1);
    let b = 80 + y * 80 / height.max(1);
    0xFF00_0000 | (r << 16) | (g << 8) | b
}

/// Arrow cursor bitmap: `#` outline, `.` fill, space transparent.
const CURSOR_SHAPE: [&[u8; 12]; 16] = [
    b"#           ",
    b"##          ",
    b"#.#         ",
    b"#..#        ",
    b"#...#       ",
    b"#....#      ",
    b"#.....#     ",
    b"#......#    ",
    b"#.......#   ",
    b"#........#  ",
    b"#.....##### ",
    b"#..#..#     ",
    b"#.# #..#    ",
    b"##  #..#    ",
    b"#    ##     ",
    b"     ##     ",
];

struct Compositor {
    windows: [Option<Window>; MAX_WINDOWS],
    next_id: u32,
    mouse_x: i32,
    mouse_y: i32,
    drag: Option<DragState>,
    backbuffer: Vec<u32>,
}

impl Compositor {
    const fn new() -> Self {
        Self {
            windows: [const { None }; MAX_WINDOWS],
            next_id: 1,
            mouse_x: 400,
            mouse_y: 300,
            drag: None,
            backbuffer: Vec::new(),
        }
    }

    fn ensure_backbuffer(&mut self) {
        if self.backbuffer.is_empty() {
            self.backbuffer
                .resize((SCREEN_WIDTH * SCREEN_HEIGHT) as usize, 0xFF00_0000);
        }
    }

    fn window_mut(&mut self, id: u32) -> Option<&mut Window> {
        self.windows
            .iter_mut()
            .flatten()
            .find(|w| w.id == id)
    }

    fn max_z(&self) -> u32 {
        self.windows
            .iter()
            .flatten()
            .map(|w| w.z_order)
            .max()
            .unwrap_or(0)
    }

    fn create(&mut self, x: i32, y: i32, w: u32, h: u32, title: &str, owner: u32) -> Option<u32> {
        if w == 0 || h == 0 {
            return None;
        }
        let slot = self.windows.iter().position(Option::is_none)?;

        // Window buffers come off the kernel heap; creation fails
        // gracefully when it is exhausted.
        let pixels = (w * h) as usize;
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(pixels).is_err() {
            log::error!("compositor: no memory for {}x{} window", w, h);
            return None;
        }
        buffer.resize(pixels, WINDOW_BG);

        let id = self.next_id;
        self.next_id += 1;
        let z_order = self.max_z() + 1;

        let mut name = String::new();
        for c in title.chars().take(63) {
            name.push(c);
        }

        self.windows[slot] = Some(Window {
            id,
            x,
            y,
            width: w,
            height: h,
            z_order,
            visible: true,
            owner,
            protected: owner == SHELL_PID,
            buffer,
            bg_color: WINDOW_BG,
            title: name,
            term: TermState::new(w / CELL_W, h / CELL_H),
        });

        log::info!(
            "compositor: window {} '{}' {}x{} at ({}, {}) for pid {}",
            id,
            title,
            w,
            h,
            x,
            y,
            owner
        );
        Some(id)
    }

    fn destroy(&mut self, id: u32) {
        for slot in &mut self.windows {
            if slot.as_ref().is_some_and(|w| w.id == id) {
                *slot = None;
                return;
            }
        }
    }

    fn window_for_pid(&self, pid: u32) -> Option<u32> {
        self.windows
            .iter()
            .flatten()
            .find(|w| w.owner == pid)
            .map(|w| w.id)
    }

    /// Owner of the top-most visible window.
    fn focus_pid(&self) -> Option<u32> {
        self.windows
            .iter()
            .flatten()
            .filter(|w| w.visible)
            .max_by_key(|w| w.z_order)
            .map(|w| w.owner)
    }

    /// Ownership-checked rectangle fill in a window's client buffer.
    /// Violations are logged and have no effect.
    fn draw_rect(&mut self, id: u32, x: i32, y: i32, w: u32, h: u32, color: u32, caller: u32) {
        let Some(win) = self.window_mut(id) else {
            return;
        };
        if win.owner != caller && caller != INIT_PID {
            log::warn!(
                "compositor: pid {} tried to draw in window {} (owner {})",
                caller,
                id,
                win.owner
            );
            return;
        }
        let (width, height) = (win.width, win.height);
        PixelSurface::new(&mut win.buffer, width, height).fill_rect(x, y, w, h, color);
    }

    fn move_window(&mut self, id: u32, x: i32, y: i32) {
        if let Some(win) = self.window_mut(id) {
            win.x = x;
            win.y = y;
        }
    }

    /// Terminal write into a window's buffer.
    fn window_write(&mut self, id: u32, bytes: &[u8]) {
        let Some(win) = self.window_mut(id) else {
            return;
        };
        let (width, height, bg) = (win.width, win.height, win.bg_color);

        for &byte in bytes {
            let update = win.term.feed(byte);
            let mut surface = PixelSurface::new(&mut win.buffer, width, height);
            if update.clear {
                surface.fill_rect(0, 0, width, height, bg);
            }
            if let Some(glyph) = update.glyph {
                let px = (glyph.cell_x * CELL_W) as i32;
                let py = (glyph.cell_y * CELL_H) as i32;
                surface.fill_rect(px, py, CELL_W, CELL_H, bg);
                surface.draw_glyph(px, py, glyph.ch, glyph.color);
            }
            if update.scroll {
                surface.scroll_up(CELL_H, bg);
            }
        }
    }

    /// Mouse motion; during a drag the grabbed window follows, keeping
    /// its title bar on screen.
    fn update_mouse(&mut self, dx: i32, dy: i32, absolute: bool) {
        if absolute {
            self.mouse_x = dx;
            self.mouse_y = dy;
        } else {
            self.mouse_x += dx;
            self.mouse_y += dy;
        }

        if let Some(drag) = &self.drag {
            let (id, off_x, off_y) = (drag.window_id, drag.off_x, drag.off_y);
            let (mx, my) = (self.mouse_x, self.mouse_y);
            if let Some(win) = self.window_mut(id) {
                win.x = mx - off_x;
                win.y = (my - off_y).max(TITLE_BAR_HEIGHT);
            }
        }

        self.mouse_x = self.mouse_x.clamp(0, SCREEN_WIDTH as i32 - 1);
        self.mouse_y = self.mouse_y.clamp(0, SCREEN_HEIGHT as i32 - 1);
    }

    /// Button press/release at the current mouse position.
    fn handle_click(&mut self, _button: i32, state: i32) {
        if state == 0 {
            self.drag = None;
            return;
        }
        if state != 1 {
            return;
        }

        let (mx, my) = (self.mouse_x, self.mouse_y);
        let hit_id = self
            .windows
            .iter()
            .flatten()
            .filter(|w| w.visible && w.contains(mx, my))
            .max_by_key(|w| w.z_order)
            .map(|w| w.id);
        let Some(id) = hit_id else {
            return;
        };

        // Raise above everything.
        let top = self.max_z() + 1;
        let (protected, in_close, in_title, wx, wy) = {
            let win = self.window_mut(id).expect("hit window vanished");
            win.z_order = top;
            (
                win.protected,
                win.in_close_box(mx, my),
                win.in_title_bar(my),
                win.x,
                win.y,
            )
        };

        if !protected && in_close {
            log::info!("compositor: close button on window {}", id);
            self.destroy(id);
            return;
        }

        if in_title {
            self.drag = Some(DragState {
                window_id: id,
                off_x: mx - wx,
                off_y: my - wy,
            });
        }
    }

    /// Composite the desktop into the backbuffer: gradient, windows in
    /// z-order with decorations and alpha blending, then the cursor.
    fn compose(&mut self) {
        self.ensure_backbuffer();

        // Work around the borrow of self.windows while writing the
        // backbuffer by splitting the struct.
        let Self {
            windows,
            backbuffer,
            mouse_x,
            mouse_y,
            ..
        } = self;
        let mut screen = PixelSurface::new(backbuffer, SCREEN_WIDTH, SCREEN_HEIGHT);

        for y in 0..SCREEN_HEIGHT {
            let color = gradient_color(y, SCREEN_HEIGHT);
            screen.fill_rect(0, y as i32, SCREEN_WIDTH, 1, color);
        }

        let mut order: [usize; MAX_WINDOWS] = [0; MAX_WINDOWS];
        let mut count = 0;
        for (i, slot) in windows.iter().enumerate() {
            if slot.as_ref().is_some_and(|w| w.visible) {
                order[count] = i;
                count += 1;
            }
        }
        order[..count].sort_unstable_by_key(|&i| windows[i].as_ref().map_or(0, |w| w.z_order));

        for &index in &order[..count] {
            let win = windows[index].as_ref().expect("visible window vanished");
            draw_decorations(&mut screen, win);
            for wy in 0..win.height as i32 {
                for wx in 0..win.width as i32 {
                    let src = win.buffer[(wy as u32 * win.width + wx as u32) as usize];
                    screen.blend_at(win.x + wx, win.y + wy, src);
                }
            }
        }

        draw_cursor(&mut screen, *mouse_x, *mouse_y);
    }
}

/// Title bar, centered title text, border, and (unless protected) the
/// close box.
fn draw_decorations(screen: &mut PixelSurface<'_>, win: &Window) {
    let top = win.y - TITLE_BAR_HEIGHT;

    screen.fill_rect(
        win.x - 1,
        top,
        win.width + 2,
        TITLE_BAR_HEIGHT as u32,
        TITLE_COLOR,
    );

    let text_w = (win.title.len() as u32 * CELL_W) as i32;
    let text_x = win.x + (win.width as i32 - text_w) / 2;
    screen.draw_text(text_x, top + 2, &win.title, 0xFFFF_FFFF);

    // Border: verticals on both flanks, horizontals above the title bar
    // and below the client area.
    let total_h = (TITLE_BAR_HEIGHT + win.height as i32 + 1) as u32;
    screen.fill_rect(win.x - 1, top, 1, total_h, BORDER_COLOR);
    screen.fill_rect(win.x + win.width as i32, top, 1, total_h, BORDER_COLOR);
    screen.fill_rect(win.x - 1, top - 1, win.width + 2, 1, BORDER_COLOR);
    screen.fill_rect(
        win.x - 1,
        win.y + win.height as i32,
        win.width + 2,
        1,
        BORDER_COLOR,
    );

    if !win.protected {
        let (bx, by) = win.close_box();
        screen.fill_rect(bx, by, CLOSE_BUTTON_SIZE as u32, CLOSE_BUTTON_SIZE as u32, CLOSE_COLOR);
        for d in 2..CLOSE_BUTTON_SIZE - 2 {
            screen.put_pixel(bx + d, by + d, 0xFFFF_FFFF);
            screen.put_pixel(bx + CLOSE_BUTTON_SIZE - 1 - d, by + d, 0xFFFF_FFFF);
        }
    }
}

fn draw_cursor(screen: &mut PixelSurface<'_>, mx: i32, my: i32) {
    for (dy, row) in CURSOR_SHAPE.iter().enumerate() {
        for (dx, &cell) in row.iter().enumerate() {
            match cell {
                b'#' => screen.put_pixel(mx + dx as i32, my + dy as i32, 0xFFFF_FFFF),
                b'.' => screen.put_pixel(mx + dx as i32, my + dy as i32, 0xFF00_0000),
                _ => {}
            }
        }
    }
}

// -- Global instance and the syscall-facing API

static COMPOSITOR: IrqSpinMutex<Compositor> = IrqSpinMutex::new(Compositor::new());

/// Allocate the backbuffer and log readiness.
pub fn init() {
    let mut c = COMPOSITOR.lock();
    c.ensure_backbuffer();
    log::info!("compositor: {}x{} backbuffer ready", SCREEN_WIDTH, SCREEN_HEIGHT);
}

/// Create a window; returns its id. Windows of the main shell are
/// protected (no close box).
pub fn create(x: i32, y: i32, w: u32, h: u32, title: &str, owner: u32) -> Option<u32> {
    COMPOSITOR.lock().create(x, y, w, h, title, owner)
}

/// Destroy a window and release its buffer.
pub fn destroy(id: u32) {
    COMPOSITOR.lock().destroy(id);
}

/// First window owned by `pid`, if any.
#[must_use]
pub fn window_for_pid(pid: u32) -> Option<u32> {
    COMPOSITOR.lock().window_for_pid(pid)
}

/// Owner of the focused (top-most visible) window.
#[must_use]
pub fn focus_pid() -> Option<u32> {
    COMPOSITOR.lock().focus_pid()
}

/// Terminal-interpret `bytes` into the window, then re-render.
pub fn window_write(id: u32, bytes: &[u8]) {
    let mut c = COMPOSITOR.lock();
    c.window_write(id, bytes);
    c.compose();
    present(&mut c);
}

/// Ownership-checked rectangle fill in a window.
pub fn draw_rect(id: u32, x: i32, y: i32, w: u32, h: u32, color: u32, caller: u32) {
    COMPOSITOR.lock().draw_rect(id, x, y, w, h, color, caller);
}

/// Reposition a window.
pub fn move_window(id: u32, x: i32, y: i32) {
    COMPOSITOR.lock().move_window(id, x, y);
}

/// Mouse motion from the input driver.
pub fn update_mouse(dx: i32, dy: i32, absolute: bool) {
    let mut c = COMPOSITOR.lock();
    c.update_mouse(dx, dy, absolute);
    if c.drag.is_some() {
        c.compose();
        present(&mut c);
    }
}

/// Button event from the input driver.
pub fn handle_click(button: i32, state: i32) {
    let mut c = COMPOSITOR.lock();
    c.handle_click(button, state);
    c.compose();
    present(&mut c);
}

/// Full composite and push to the screen.
pub fn render() {
    let mut c = COMPOSITOR.lock();
    c.compose();
    present(&mut c);
}

/// Direct fill into the backbuffer, for processes with no window (the
/// init splash). Not pushed until [`flush`].
pub fn fill_screen_rect(x: i32, y: i32, w: u32, h: u32, color: u32) {
    let mut c = COMPOSITOR.lock();
    c.ensure_backbuffer();
    PixelSurface::new(&mut c.backbuffer, SCREEN_WIDTH, SCREEN_HEIGHT).fill_rect(x, y, w, h, color);
}

/// Re-render request: composite when windows exist, otherwise push the
/// backbuffer as drawn (splash path).
pub fn flush() {
    let mut c = COMPOSITOR.lock();
    if c.windows.iter().flatten().any(|w| w.visible) {
        c.compose();
    } else {
        c.ensure_backbuffer();
    }
    present(&mut c);
}

/// Copy the backbuffer to the GPU backing store and flush the full
/// extent.
fn present(c: &mut Compositor) {
    let Some(fb) = gpu::framebuffer() else {
        return;
    };
    // SAFETY: The backing store is screen-sized, identity-mapped, and
    // owned by the GPU driver; we only write pixels.
    unsafe {
        core::ptr::copy_nonoverlapping(
            c.backbuffer.as_ptr(),
            fb.as_u64() as *mut u32,
            c.backbuffer.len(),
        );
    }
    gpu::flush(0, 0, SCREEN_WIDTH, SCREEN_HEIGHT);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compositor() -> Compositor {
        let mut c = Compositor::new();
        c.ensure_backbuffer();
        c
    }

    fn pixel(c: &Compositor, x: u32, y: u32) -> u32 {
        c.backbuffer[(y * SCREEN_WIDTH + x) as usize]
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let mut c = compositor();
        let a = c.create(10, 30, 100, 80, "a", 2).unwrap();
        let b = c.create(20, 40, 100, 80, "b", 3).unwrap();
        assert!(a >= 1);
        assert_eq!(b, a + 1);
        assert_eq!(c.window_for_pid(2), Some(a));
        assert_eq!(c.window_for_pid(3), Some(b));
        assert_eq!(c.window_for_pid(9), None);
    }

    #[test]
    fn test_shell_windows_are_protected() {
        let mut c = compositor();
        let shell = c.create(0, 30, 50, 50, "sh", SHELL_PID).unwrap();
        let other = c.create(0, 30, 50, 50, "x", 3).unwrap();
        assert!(c.window_mut(shell).unwrap().protected);
        assert!(!c.window_mut(other).unwrap().protected);
    }

    #[test]
    fn test_focus_follows_z_order() {
        let mut c = compositor();
        c.create(0, 30, 50, 50, "a", 2).unwrap();
        let b = c.create(10, 40, 50, 50, "b", 3).unwrap();
        assert_eq!(c.focus_pid(), Some(3));

        // Click on window a's title bar raises it.
        c.mouse_x = 5;
        c.mouse_y = 25;
        c.handle_click(0x110, 1);
        assert_eq!(c.focus_pid(), Some(2));
        let _ = b;
    }

    #[test]
    fn test_draw_rect_enforces_ownership() {
        let mut c = compositor();
        let a = c.create(0, 30, 10, 10, "a", 2).unwrap();
        // Owner draws.
        c.draw_rect(a, 0, 0, 10, 10, 0xFF123456, 2);
        assert_eq!(c.window_mut(a).unwrap().buffer[0], 0xFF123456);
        // Foreign pid has no effect.
        c.draw_rect(a, 0, 0, 10, 10, 0xFF654321, 3);
        assert_eq!(c.window_mut(a).unwrap().buffer[0], 0xFF123456);
        // Init (pid 1) is exempt.
        c.draw_rect(a, 0, 0, 10, 10, 0xFFABCDEF, 1);
        assert_eq!(c.window_mut(a).unwrap().buffer[0], 0xFFABCDEF);
    }

    #[test]
    fn test_isolated_client_areas_after_compose() {
        // Two windows, each painted by its owner: neither color leaks
        // into the other's client area on screen.
        let mut c = compositor();
        let a = c.create(50, 100, 60, 40, "a", 2).unwrap();
        let b = c.create(300, 100, 60, 40, "b", 3).unwrap();
        c.draw_rect(a, 0, 0, 60, 40, 0xFFAA0000, 2);
        c.draw_rect(b, 0, 0, 60, 40, 0xFF00AA00, 3);
        c.compose();

        assert_eq!(pixel(&c, 80, 120), 0xFFAA0000);
        assert_eq!(pixel(&c, 330, 120), 0xFF00AA00);
        // No red anywhere in b's client area.
        for y in 100..140 {
            for x in 300..360 {
                assert_ne!(pixel(&c, x, y), 0xFFAA0000);
            }
        }
    }

    #[test]
    fn test_topmost_window_wins_overlap() {
        let mut c = compositor();
        let a = c.create(100, 100, 80, 80, "a", 2).unwrap();
        let b = c.create(120, 120, 80, 80, "b", 3).unwrap();
        c.draw_rect(a, 0, 0, 80, 80, 0xFF111111, 2);
        c.draw_rect(b, 0, 0, 80, 80, 0xFF222222, 3);
        c.compose();
        // In the overlap, the later (higher-z) window shows.
        assert_eq!(pixel(&c, 150, 150), 0xFF222222);
        // Outside the overlap, a shows.
        assert_eq!(pixel(&c, 105, 105), 0xFF111111);
    }

    #[test]
    fn test_background_is_gradient_where_uncovered() {
        let mut c = compositor();
        c.compose();
        assert_eq!(pixel(&c, 0, 0), gradient_color(0, SCREEN_HEIGHT));
        assert_eq!(
            pixel(&c, 799, 599),
            gradient_color(599, SCREEN_HEIGHT)
        );
        assert_ne!(pixel(&c, 0, 0), pixel(&c, 0, 599));
    }

    #[test]
    fn test_close_button_destroys_unprotected_window() {
        let mut c = compositor();
        let id = c.create(100, 100, 80, 80, "x", 3).unwrap();
        let (bx, by) = c.window_mut(id).unwrap().close_box();
        c.mouse_x = bx + 4;
        c.mouse_y = by + 4;
        c.handle_click(0x110, 1);
        assert!(c.window_mut(id).is_none());
    }

    #[test]
    fn test_protected_window_ignores_close_box() {
        let mut c = compositor();
        let id = c.create(100, 100, 80, 80, "sh", SHELL_PID).unwrap();
        let (bx, by) = c.window_mut(id).unwrap().close_box();
        c.mouse_x = bx + 4;
        c.mouse_y = by + 4;
        c.handle_click(0x110, 1);
        assert!(c.window_mut(id).is_some());
    }

    #[test]
    fn test_title_bar_drag_moves_window() {
        let mut c = compositor();
        let id = c.create(100, 100, 80, 80, "x", 3).unwrap();
        c.mouse_x = 110;
        c.mouse_y = 90; // inside the title bar strip
        c.handle_click(0x110, 1);
        assert!(c.drag.is_some());

        c.update_mouse(50, 30, false);
        let win = c.window_mut(id).unwrap();
        assert_eq!(win.x, 150);
        assert_eq!(win.y, 130);

        c.handle_click(0x110, 0);
        assert!(c.drag.is_none());
    }

    #[test]
    fn test_drag_keeps_title_bar_on_screen() {
        let mut c = compositor();
        let id = c.create(100, 100, 80, 80, "x", 3).unwrap();
        c.mouse_x = 110;
        c.mouse_y = 90;
        c.handle_click(0x110, 1);
        c.update_mouse(0, -500, false);
        let win = c.window_mut(id).unwrap();
        assert!(win.y >= TITLE_BAR_HEIGHT);
    }

    #[test]
    fn test_mouse_clamps_to_screen() {
        let mut c = compositor();
        c.update_mouse(-10_000, -10_000, false);
        assert_eq!((c.mouse_x, c.mouse_y), (0, 0));
        c.update_mouse(10_000, 10_000, false);
        assert_eq!(
            (c.mouse_x, c.mouse_y),
            (SCREEN_WIDTH as i32 - 1, SCREEN_HEIGHT as i32 - 1)
        );
    }

    #[test]
    fn test_window_write_renders_green_text() {
        let mut c = compositor();
        let id = c.create(100, 100, 160, 130, "t", 2).unwrap();
        c.window_write(id, b"\x1b[32mOK\x1b[0m\n");

        let win = c.window_mut(id).unwrap();
        // Some pixel in the first two cells carries the SGR green.
        let mut found_green = false;
        for y in 0..CELL_H {
            for x in 0..CELL_W * 2 {
                if win.buffer[(y * 160 + x) as usize] == 0xFF00_BB00 {
                    found_green = true;
                }
            }
        }
        assert!(found_green, "no green glyph pixels rendered");
        assert_eq!(win.term.cursor(), (0, 1));
    }

    #[test]
    fn test_destroyed_window_leaves_gradient() {
        let mut c = compositor();
        let id = c.create(200, 200, 50, 50, "x", 3).unwrap();
        c.draw_rect(id, 0, 0, 50, 50, 0xFF996633, 3);
        c.compose();
        assert_eq!(pixel(&c, 210, 210), 0xFF996633);
        c.destroy(id);
        c.compose();
        assert_eq!(pixel(&c, 210, 210), gradient_color(210, SCREEN_HEIGHT));
    }
}
