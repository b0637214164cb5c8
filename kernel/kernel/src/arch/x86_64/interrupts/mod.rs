//! Exception capture and hardware interrupt wiring.
//!
//! Vectors 0-31 dump the faulting frame over the log sink and halt the
//! CPU; there is no recovery from an exception. Vectors 32-47 carry the
//! remapped PIC IRQs into [`crate::irq::dispatch`]. Vector 0xF0 is the
//! scheduler entry, installed from [`sched_stub`].

pub mod sched_stub;

use super::{idt, instructions, pit};
use crate::config::{IRQ_BASE_VECTOR, PIT_HZ};
use crate::drivers::pic;

/// The frame the CPU pushes on interrupt entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    /// Interrupted instruction pointer.
    pub rip: u64,
    /// Interrupted code segment.
    pub cs: u64,
    /// Saved flags.
    pub rflags: u64,
    /// Interrupted stack pointer.
    pub rsp: u64,
    /// Interrupted stack segment.
    pub ss: u64,
}

/// Terminal exception path: log the frame, halt this CPU forever.
/// Other CPUs keep running their tasks.
fn fatal_exception(vector: u8, frame: &InterruptFrame, error: Option<u64>) -> ! {
    instructions::disable_interrupts();
    crate::kfatal!(
        "unhandled exception vector={:#x} rip={:#x} rsp={:#x}",
        vector,
        frame.rip,
        frame.rsp
    );
    crate::kfatal!(
        "  cs={:#x} ss={:#x} rflags={:#x}",
        frame.cs,
        frame.ss,
        frame.rflags
    );
    if let Some(code) = error {
        crate::kfatal!("  error code={:#x}", code);
    }
    instructions::halt_forever()
}

macro_rules! exception_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptFrame) {
            fatal_exception($vector, &frame, None);
        }
    };
    ($name:ident, $vector:expr, err) => {
        extern "x86-interrupt" fn $name(frame: InterruptFrame, error: u64) {
            fatal_exception($vector, &frame, Some(error));
        }
    };
}

exception_handler!(ex_divide_error, 0);
exception_handler!(ex_debug, 1);
exception_handler!(ex_nmi, 2);
exception_handler!(ex_breakpoint, 3);
exception_handler!(ex_overflow, 4);
exception_handler!(ex_bound_range, 5);
exception_handler!(ex_invalid_opcode, 6);
exception_handler!(ex_device_not_available, 7);
exception_handler!(ex_double_fault, 8, err);
exception_handler!(ex_coprocessor_overrun, 9);
exception_handler!(ex_invalid_tss, 10, err);
exception_handler!(ex_segment_not_present, 11, err);
exception_handler!(ex_stack_segment, 12, err);
exception_handler!(ex_general_protection, 13, err);
exception_handler!(ex_page_fault, 14, err);
exception_handler!(ex_reserved_15, 15);
exception_handler!(ex_x87_fp, 16);
exception_handler!(ex_alignment_check, 17, err);
exception_handler!(ex_machine_check, 18);
exception_handler!(ex_simd_fp, 19);
exception_handler!(ex_virtualization, 20);
exception_handler!(ex_control_protection, 21, err);
exception_handler!(ex_reserved_22, 22);
exception_handler!(ex_reserved_23, 23);
exception_handler!(ex_reserved_24, 24);
exception_handler!(ex_reserved_25, 25);
exception_handler!(ex_reserved_26, 26);
exception_handler!(ex_reserved_27, 27);
exception_handler!(ex_hypervisor_injection, 28);
exception_handler!(ex_vmm_communication, 29);
exception_handler!(ex_security, 30, err);
exception_handler!(ex_reserved_31, 31);

macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptFrame) {
            crate::irq::dispatch($irq);
        }
    };
}

irq_stub!(irq0, 0);
irq_stub!(irq1, 1);
irq_stub!(irq2, 2);
irq_stub!(irq3, 3);
irq_stub!(irq4, 4);
irq_stub!(irq5, 5);
irq_stub!(irq6, 6);
irq_stub!(irq7, 7);
irq_stub!(irq8, 8);
irq_stub!(irq9, 9);
irq_stub!(irq10, 10);
irq_stub!(irq11, 11);
irq_stub!(irq12, 12);
irq_stub!(irq13, 13);
irq_stub!(irq14, 14);
irq_stub!(irq15, 15);

type PlainHandler = extern "x86-interrupt" fn(InterruptFrame);
type ErrHandler = extern "x86-interrupt" fn(InterruptFrame, u64);

enum Gate {
    Plain(PlainHandler),
    WithErr(ErrHandler),
}

impl Gate {
    fn addr(&self) -> u64 {
        match self {
            Self::Plain(f) => *f as usize as u64,
            Self::WithErr(f) => *f as usize as u64,
        }
    }
}

fn exception_gates() -> [Gate; 32] {
    use Gate::{Plain, WithErr};
    [
        Plain(ex_divide_error),
        Plain(ex_debug),
        Plain(ex_nmi),
        Plain(ex_breakpoint),
        Plain(ex_overflow),
        Plain(ex_bound_range),
        Plain(ex_invalid_opcode),
        Plain(ex_device_not_available),
        WithErr(ex_double_fault),
        Plain(ex_coprocessor_overrun),
        WithErr(ex_invalid_tss),
        WithErr(ex_segment_not_present),
        WithErr(ex_stack_segment),
        WithErr(ex_general_protection),
        WithErr(ex_page_fault),
        Plain(ex_reserved_15),
        Plain(ex_x87_fp),
        WithErr(ex_alignment_check),
        Plain(ex_machine_check),
        Plain(ex_simd_fp),
        Plain(ex_virtualization),
        WithErr(ex_control_protection),
        Plain(ex_reserved_22),
        Plain(ex_reserved_23),
        Plain(ex_reserved_24),
        Plain(ex_reserved_25),
        Plain(ex_reserved_26),
        Plain(ex_reserved_27),
        Plain(ex_hypervisor_injection),
        Plain(ex_vmm_communication),
        WithErr(ex_security),
        Plain(ex_reserved_31),
    ]
}

const IRQ_STUBS: [PlainHandler; 16] = [
    irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
    irq14, irq15,
];

fn build_idt() {
    idt::set_selector(instructions::read_cs());
    for (vector, gate) in exception_gates().iter().enumerate() {
        // SAFETY: each handler matches its vector's error-code shape.
        unsafe { idt::set_vector(vector as u8, gate.addr()) };
    }
    for (irq, stub) in IRQ_STUBS.iter().enumerate() {
        // SAFETY: IRQ stubs take a plain frame and iretq via the
        // x86-interrupt ABI.
        unsafe { idt::set_vector(IRQ_BASE_VECTOR + irq as u8, *stub as usize as u64) };
    }
    sched_stub::install();
}

/// BSP interrupt bring-up: IDT, PIC remap + initial masks, PIT tick.
///
/// Leaves IRQs 0 (timer) and 1 (keyboard) unmasked; the mouse and NIC
/// lines are opened by their drivers.
///
/// # Safety
///
/// Must run once, with interrupts disabled, before any device expects
/// its IRQ to be delivered.
pub unsafe fn init() {
    build_idt();
    // SAFETY: gates are fully populated above.
    unsafe { idt::load() };
    // SAFETY: early boot, interrupts disabled.
    unsafe {
        pic::remap();
        pic::write_masks(0xFC, 0xFF);
        pit::init(PIT_HZ as u32);
    }
    instructions::enable_interrupts();
}

/// AP interrupt bring-up: the shared IDT is loaded on this CPU.
///
/// # Safety
///
/// The BSP must have completed [`init`] first.
pub unsafe fn init_ap() {
    // SAFETY: gates were populated by the BSP.
    unsafe { idt::load() };
    instructions::enable_interrupts();
}
