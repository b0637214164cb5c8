//! LAPIC-ID to CPU-index mapping.
//!
//! The scheduler and the boot path address CPUs by dense index; the
//! hardware reports sparse LAPIC IDs. Every CPU registers its mapping
//! before entering the scheduler.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::drivers::lapic;

const MAX_LAPIC_ID: usize = 256;

static LAPIC_TO_INDEX: [AtomicU32; MAX_LAPIC_ID] =
    [const { AtomicU32::new(0) }; MAX_LAPIC_ID];

/// Records that the CPU with `lapic_id` is scheduler CPU `index`.
pub fn register_cpu(lapic_id: u32, index: u32) {
    if (lapic_id as usize) < MAX_LAPIC_ID {
        LAPIC_TO_INDEX[lapic_id as usize].store(index, Ordering::Release);
    }
}

/// The calling CPU's scheduler index (0 when unregistered, which is
/// correct for the BSP during early boot).
#[must_use]
pub fn cpu_index() -> usize {
    let id = lapic::id() as usize;
    if id < MAX_LAPIC_ID {
        LAPIC_TO_INDEX[id].load(Ordering::Acquire) as usize
    } else {
        0
    }
}
