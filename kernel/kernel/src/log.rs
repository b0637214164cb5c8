//! Serial-backed log sink and the panic path.

use core::fmt::Write;

use quasar_core::log::{self, LogLevel};
use quasar_core::sync::SpinLock;

use crate::drivers::serial::{COM1, Uart};

static LOG_LOCK: SpinLock<()> = SpinLock::new(());

fn serial_sink(level: LogLevel, args: core::fmt::Arguments<'_>) {
    // Serialize whole lines; if the lock is contended (a fault while
    // logging), write anyway rather than deadlock the panic path.
    let guard = LOG_LOCK.try_lock();
    let mut uart = Uart::new(COM1);
    let _ = write!(
        uart,
        "[{:>5}s] {} {}\n",
        crate::time::uptime_seconds(),
        level.tag(),
        args
    );
    drop(guard);
}

/// Brings up COM1 and routes the `klog!` family to it.
pub fn init_early() {
    let uart = Uart::new(COM1);
    // SAFETY: COM1 is the standard UART on this hardware model.
    unsafe { uart.init() };
    // SAFETY: serial_sink only touches the UART and the tick counter,
    // both safe from any context.
    unsafe { log::set_sink(serial_sink) };
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    crate::arch::x86_64::instructions::disable_interrupts();
    crate::kfatal!("kernel panic: {}", info);
    crate::arch::x86_64::instructions::halt_forever()
}
