//! PS/2 controller IRQ handlers.
//!
//! IRQ 1 and IRQ 12 read the data port and feed the raw bytes into the
//! input queue; decoding happens there, outside interrupt context's
//! critical constraints.

use crate::arch::x86_64::Port;
use crate::drivers::pic;
use crate::irq::IrqHandler;

const DATA_PORT: u16 = 0x60;

struct KeyboardIrq;

impl IrqHandler for KeyboardIrq {
    fn handle(&self, _irq: u8) {
        // SAFETY: reading the PS/2 data port acknowledges the byte.
        let scancode = unsafe { Port::<u8>::new(DATA_PORT).read() };
        if let Some(kernel) = crate::kernel::try_kernel() {
            kernel.input.push_scancode(scancode);
        }
    }
}

struct MouseIrq;

impl IrqHandler for MouseIrq {
    fn handle(&self, _irq: u8) {
        // SAFETY: reading the PS/2 data port acknowledges the byte.
        let byte = unsafe { Port::<u8>::new(DATA_PORT).read() };
        if let Some(kernel) = crate::kernel::try_kernel() {
            kernel.input.push_mouse_byte(byte);
        }
    }
}

static KEYBOARD_IRQ: KeyboardIrq = KeyboardIrq;
static MOUSE_IRQ: MouseIrq = MouseIrq;

/// Registers the keyboard and mouse handlers and opens their lines.
pub fn init() {
    let kernel = crate::kernel::kernel();
    kernel.irq.register(1, &KEYBOARD_IRQ);
    kernel.irq.register(12, &MOUSE_IRQ);
    pic::unmask(1);
    pic::unmask(12);
}
