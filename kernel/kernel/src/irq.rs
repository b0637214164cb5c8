//! Hardware IRQ dispatch.
//!
//! Each of the 16 legacy lines carries a per-IRQ counter and an
//! optional registered handler. IRQ 0 (the PIT) is hardwired to the
//! tick counter and the scheduler's wake-up pass; everything else goes
//! through the handler table. Dispatch runs in interrupt context, so
//! the table is only ever `try_lock`ed — a registration racing an
//! interrupt loses that one delivery, never deadlocks.

use core::sync::atomic::{AtomicU64, Ordering};

use quasar_core::sync::SpinLock;

use crate::drivers::pic;

/// Number of legacy PIC lines.
pub const IRQ_LINES: usize = 16;

/// A device interrupt handler. Implementations run in interrupt
/// context: short, no blocking, no table locks.
pub trait IrqHandler: Sync {
    /// Services the interrupt on line `irq`.
    fn handle(&self, irq: u8);
}

/// The handler table plus per-line delivery counters.
pub struct IrqTable {
    handlers: SpinLock<[Option<&'static dyn IrqHandler>; IRQ_LINES]>,
    counts: [AtomicU64; IRQ_LINES],
}

impl IrqTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: SpinLock::new([None; IRQ_LINES]),
            counts: [const { AtomicU64::new(0) }; IRQ_LINES],
        }
    }

    /// Installs `handler` on `irq`, replacing any previous one.
    pub fn register(&self, irq: u8, handler: &'static dyn IrqHandler) {
        if let Some(slot) = self.handlers.lock().get_mut(usize::from(irq)) {
            *slot = Some(handler);
        }
    }

    /// Deliveries observed on `irq`.
    #[must_use]
    pub fn count(&self, irq: u8) -> u64 {
        self.counts
            .get(usize::from(irq))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn deliver(&self, irq: u8) {
        self.counts[usize::from(irq)].fetch_add(1, Ordering::Relaxed);
        let handler = self
            .handlers
            .try_lock()
            .and_then(|table| table[usize::from(irq)]);
        if let Some(handler) = handler {
            handler.handle(irq);
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for the vectored IRQ stubs (vectors 0x20-0x2F).
pub fn dispatch(irq: u8) {
    if irq == 0 {
        crate::time::on_timer_tick();
        if let Some(kernel) = crate::kernel::try_kernel() {
            kernel.irq.counts[0].fetch_add(1, Ordering::Relaxed);
            kernel.sched.on_tick(crate::time::ticks());
        }
    } else if let Some(kernel) = crate::kernel::try_kernel() {
        kernel.irq.deliver(irq);
    }
    pic::eoi(irq);
}
