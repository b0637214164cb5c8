//! Collaborator contracts.
//!
//! The desktop, terminal, shell, file manager and browser are external
//! collaborators: the kernel only defines the surfaces they consume —
//! decoded input streams, a framebuffer target, and a registration
//! point the `desktop` task drives. Their rendering and behavior live
//! outside the core.

use quasar_core::sync::{OnceLock, SpinLock};

// ---------------------------------------------------------------------------
// Input queue
// ---------------------------------------------------------------------------

/// A decoded keyboard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyEvent {
    /// Raw PS/2 scancode (set 1, make code).
    pub scancode: u8,
    /// Press (`true`) or release.
    pub pressed: bool,
    /// Shift held when the event fired.
    pub shift: bool,
    /// Alt held when the event fired.
    pub alt: bool,
}

/// A decoded mouse movement/button event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseEvent {
    /// Horizontal movement delta.
    pub dx: i16,
    /// Vertical movement delta (positive is up, per the device).
    pub dy: i16,
    /// Button bitmask (bit 0 left, 1 right, 2 middle).
    pub buttons: u8,
}

const QUEUE_CAP: usize = 64;

struct Ring<T: Copy + Default> {
    items: [T; QUEUE_CAP],
    head: usize,
    len: usize,
}

impl<T: Copy + Default> Ring<T> {
    const fn new(zero: T) -> Self {
        Self {
            items: [zero; QUEUE_CAP],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, item: T) {
        if self.len == QUEUE_CAP {
            // Overflow drops the oldest event.
            self.head = (self.head + 1) % QUEUE_CAP;
            self.len -= 1;
        }
        self.items[(self.head + self.len) % QUEUE_CAP] = item;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.items[self.head];
        self.head = (self.head + 1) % QUEUE_CAP;
        self.len -= 1;
        Some(item)
    }
}

struct InputState {
    keys: Ring<KeyEvent>,
    mice: Ring<MouseEvent>,
    shift: bool,
    alt: bool,
    mouse_packet: [u8; 3],
    mouse_fill: usize,
}

/// Decoded keyboard and mouse streams, fed from the IRQ handlers and
/// drained by the desktop collaborator.
pub struct InputQueue {
    state: SpinLock<InputState>,
}

/// Scancodes for the modifier keys tracked here.
const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;
const SC_ALT: u8 = 0x38;
/// Release codes have the top bit set.
const SC_RELEASE: u8 = 0x80;

impl InputQueue {
    /// An empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(InputState {
                keys: Ring::new(KeyEvent {
                    scancode: 0,
                    pressed: false,
                    shift: false,
                    alt: false,
                }),
                mice: Ring::new(MouseEvent {
                    dx: 0,
                    dy: 0,
                    buttons: 0,
                }),
                shift: false,
                alt: false,
                mouse_packet: [0; 3],
                mouse_fill: 0,
            }),
        }
    }

    /// Feeds one raw keyboard scancode (IRQ 1 context).
    pub fn push_scancode(&self, scancode: u8) {
        let Some(mut state) = self.state.try_lock() else {
            return; // drop rather than spin in the ISR
        };
        let pressed = scancode & SC_RELEASE == 0;
        let code = scancode & !SC_RELEASE;
        match code {
            SC_LSHIFT | SC_RSHIFT => state.shift = pressed,
            SC_ALT => state.alt = pressed,
            _ => {}
        }
        let (shift, alt) = (state.shift, state.alt);
        state.keys.push(KeyEvent {
            scancode: code,
            pressed,
            shift,
            alt,
        });
    }

    /// Feeds one raw mouse byte (IRQ 12 context); every third byte
    /// completes a packet.
    pub fn push_mouse_byte(&self, byte: u8) {
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        // Resynchronize: the first packet byte always has bit 3 set.
        if state.mouse_fill == 0 && byte & 0x08 == 0 {
            return;
        }
        let fill = state.mouse_fill;
        state.mouse_packet[fill] = byte;
        state.mouse_fill += 1;
        if state.mouse_fill < 3 {
            return;
        }
        state.mouse_fill = 0;
        let [flags, raw_dx, raw_dy] = state.mouse_packet;
        let dx = i16::from(raw_dx) - if flags & 0x10 != 0 { 256 } else { 0 };
        let dy = i16::from(raw_dy) - if flags & 0x20 != 0 { 256 } else { 0 };
        state.mice.push(MouseEvent {
            dx,
            dy,
            buttons: flags & 0x07,
        });
    }

    /// Takes the next keyboard event.
    pub fn pop_key(&self) -> Option<KeyEvent> {
        self.state.lock().keys.pop()
    }

    /// Takes the next mouse event.
    pub fn pop_mouse(&self) -> Option<MouseEvent> {
        self.state.lock().mice.pop()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Framebuffer contract
// ---------------------------------------------------------------------------

/// A rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width.
    pub w: u32,
    /// Height.
    pub h: u32,
}

/// The surface the desktop compositor draws through. Implemented
/// outside the core over the boot framebuffer.
pub trait Framebuffer: Sync {
    /// Screen width in pixels.
    fn width(&self) -> u32;
    /// Screen height in pixels.
    fn height(&self) -> u32;
    /// Fills a clipped rectangle in the back buffer.
    fn fill_rect(&self, rect: Rect, color: u32);
    /// Draws clipped text at a pixel position.
    fn draw_text(&self, x: u32, y: u32, text: &str, color: u32);
    /// Presents the whole back buffer.
    fn present(&self);
    /// Presents one region of the back buffer.
    fn present_rect(&self, rect: Rect);
}

// ---------------------------------------------------------------------------
// Desktop hooks
// ---------------------------------------------------------------------------

/// The desktop collaborator: one init call, then one frame per loop
/// iteration of the `desktop` task.
pub trait DesktopHooks: Sync {
    /// One-time setup (build windows, paint the background).
    fn init(&self);
    /// One event-pump/render pass.
    fn frame(&self);
}

static DESKTOP: OnceLock<&'static dyn DesktopHooks> = OnceLock::new();

/// Registers the desktop implementation. One registration wins.
pub fn register_desktop(hooks: &'static dyn DesktopHooks) {
    let _ = DESKTOP.set(hooks);
}

/// The registered desktop, if any.
#[must_use]
pub fn desktop() -> Option<&'static dyn DesktopHooks> {
    DESKTOP.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_events_carry_modifier_state() {
        let queue = InputQueue::new();
        queue.push_scancode(SC_LSHIFT);
        queue.push_scancode(0x1E); // 'a' make
        queue.push_scancode(SC_LSHIFT | SC_RELEASE);
        queue.push_scancode(0x1E | SC_RELEASE);

        let shift_down = queue.pop_key().unwrap();
        assert_eq!(shift_down.scancode, SC_LSHIFT);
        assert!(shift_down.pressed);

        let a_down = queue.pop_key().unwrap();
        assert_eq!(a_down.scancode, 0x1E);
        assert!(a_down.pressed && a_down.shift);

        let _shift_up = queue.pop_key().unwrap();
        let a_up = queue.pop_key().unwrap();
        assert!(!a_up.pressed);
        assert!(!a_up.shift);
        assert!(queue.pop_key().is_none());
    }

    #[test]
    fn mouse_packets_assemble_with_sign_extension() {
        let queue = InputQueue::new();
        // Left button, dx negative: flags with bit3|bit0|bit4.
        queue.push_mouse_byte(0x08 | 0x01 | 0x10);
        queue.push_mouse_byte(0xFB); // -5 as two's complement byte
        queue.push_mouse_byte(0x0A); // +10
        let event = queue.pop_mouse().unwrap();
        assert_eq!(event.dx, -5);
        assert_eq!(event.dy, 10);
        assert_eq!(event.buttons, 0x01);
    }

    #[test]
    fn stray_mouse_bytes_resync() {
        let queue = InputQueue::new();
        queue.push_mouse_byte(0x00); // bit 3 clear: dropped
        queue.push_mouse_byte(0x08);
        queue.push_mouse_byte(0x01);
        queue.push_mouse_byte(0x01);
        let event = queue.pop_mouse().unwrap();
        assert_eq!(event.dx, 1);
        assert_eq!(event.dy, 1);
        assert!(queue.pop_mouse().is_none());
    }

    #[test]
    fn ring_overflow_drops_oldest() {
        let queue = InputQueue::new();
        for i in 0..(QUEUE_CAP as u8 + 4) {
            queue.push_scancode(i % 0x40 + 1);
        }
        // The queue kept the most recent QUEUE_CAP events.
        let mut drained = 0;
        while queue.pop_key().is_some() {
            drained += 1;
        }
        assert_eq!(drained, QUEUE_CAP);
    }
}
