//! Tick counting and coarse sleeping.
//!
//! The PIT drives IRQ 0 at `PIT_HZ`; every interrupt bumps the global
//! tick counter. All protocol timeouts and the scheduler's sleep
//! deadlines are expressed in these ticks.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::instructions;
use crate::config::PIT_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);
static UPTIME_SECONDS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
#[inline]
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Whole seconds since boot.
#[inline]
#[must_use]
pub fn uptime_seconds() -> u64 {
    UPTIME_SECONDS.load(Ordering::Relaxed)
}

/// Timer-interrupt hook; called once per PIT tick on the BSP.
pub(crate) fn on_timer_tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if now % PIT_HZ == 0 {
        UPTIME_SECONDS.fetch_add(1, Ordering::Relaxed);
    }
}

/// Busy-halts the calling CPU until `ticks` more timer ticks have
/// elapsed. Interruptible; used by code running outside the scheduler
/// (early boot, calibration).
pub fn sleep_ticks(count: u64) {
    let deadline = ticks() + count;
    while ticks() < deadline {
        instructions::halt();
    }
}
