//! The kernel value: every mutable subsystem singleton in one place.
//!
//! Constructed exactly once during [`crate::boot::kernel_init`] and
//! reachable afterwards through [`kernel`]. Interrupt paths use
//! [`try_kernel`] so a vector that fires before construction degrades
//! to a no-op instead of a panic.

use quasar_core::sync::OnceLock;

use crate::irq::IrqTable;
use crate::net::NetService;
use crate::sched::Scheduler;
use crate::services::InputQueue;
use crate::storage::StorageService;

/// All process-wide kernel state.
pub struct Kernel {
    /// The SMP scheduler.
    pub sched: Scheduler,
    /// Hardware IRQ dispatch table.
    pub irq: IrqTable,
    /// Keyboard/mouse event queues.
    pub input: InputQueue,
    /// The network stack service.
    pub net: NetService,
    /// The mounted filesystem service.
    pub storage: StorageService,
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

/// Builds the kernel value. Panics on double initialization.
pub fn init(cpu_count: usize) -> &'static Kernel {
    let kernel = Kernel {
        sched: Scheduler::new(cpu_count),
        irq: IrqTable::new(),
        input: InputQueue::new(),
        net: NetService::new(),
        storage: StorageService::new(),
    };
    assert!(
        KERNEL.set(kernel).is_ok(),
        "kernel value initialized twice"
    );
    kernel_ref()
}

fn kernel_ref() -> &'static Kernel {
    KERNEL.get().expect("kernel value not initialized")
}

/// The kernel value. Panics before [`init`].
#[must_use]
pub fn kernel() -> &'static Kernel {
    kernel_ref()
}

/// The kernel value, or `None` before [`init`] (interrupt-safe).
#[must_use]
pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}
