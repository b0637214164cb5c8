//! x86_64 architecture layer: instructions, PIT, IDT, and the
//! interrupt plumbing.

pub mod idt;
pub mod instructions;
pub mod interrupts;
pub mod pit;

pub use instructions::port::Port;
