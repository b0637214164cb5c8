//! Interrupt Descriptor Table.
//!
//! 256 raw 16-byte gates. Exception and IRQ handlers are installed
//! during [`interrupts::init`](super::interrupts::init); the scheduler
//! claims its own vector through [`set_vector`].

use quasar_core::sync::SpinLock;

/// Interrupt gate, present, DPL 0.
const GATE_INTERRUPT: u8 = 0x8E;

/// One IDT gate descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl GateDescriptor {
    const fn empty() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn new(handler: u64, selector: u16) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            type_attr: GATE_INTERRUPT,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

/// The table itself, plus the code selector gates are built with.
struct Idt {
    gates: [GateDescriptor; 256],
    selector: u16,
}

static IDT: SpinLock<Idt> = SpinLock::new(Idt {
    gates: [GateDescriptor::empty(); 256],
    selector: 0,
});

/// Records the kernel code selector used for every gate. Must run
/// before any `set_vector` call.
pub fn set_selector(selector: u16) {
    IDT.lock().selector = selector;
}

/// Points `vector` at `handler` (a raw entry address).
///
/// # Safety
///
/// `handler` must be the address of a routine that follows the
/// interrupt calling convention for this vector (correct error-code
/// handling, `iretq` return).
pub unsafe fn set_vector(vector: u8, handler: u64) {
    let mut idt = IDT.lock();
    let selector = idt.selector;
    idt.gates[usize::from(vector)] = GateDescriptor::new(handler, selector);
}

/// Loads the table into this CPU.
///
/// Every CPU calls this once; the table contents are shared.
///
/// # Safety
///
/// The gates must be fully populated and the GDT providing the
/// recorded selector must be live.
pub unsafe fn load() {
    let idt = IDT.lock();
    let pointer = IdtPointer {
        limit: (core::mem::size_of::<[GateDescriptor; 256]>() - 1) as u16,
        base: core::ptr::from_ref(&idt.gates) as u64,
    };
    // SAFETY: pointer describes a static table that lives forever.
    unsafe {
        core::arch::asm!("lidt [{0}]", in(reg) &pointer, options(readonly, nostack));
    }
}
