//! Compile-time kernel configuration.

/// PIT (and LAPIC scheduler timer) frequency in ticks per second.
pub const PIT_HZ: u64 = 250;

/// Kernel heap arena size.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Interrupt vector reserved for the scheduler (yield + LAPIC timer).
pub const SCHED_VECTOR: u8 = 0xF0;

/// Maximum number of tasks in the fixed table.
pub const MAX_TASKS: usize = 64;

/// Maximum number of CPUs the scheduler tracks.
pub const MAX_CPUS: usize = 64;

/// Stack size handed to every task.
pub const TASK_STACK_SIZE: usize = 32 * 1024;

/// Vector that hardware IRQ 0 maps to after the PIC remap.
pub const IRQ_BASE_VECTOR: u8 = 0x20;
