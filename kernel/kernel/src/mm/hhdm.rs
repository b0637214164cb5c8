//! The bootloader-provided higher-half direct map offset.

use core::sync::atomic::{AtomicU64, Ordering};

use quasar_core::addr::{PhysAddr, VirtAddr};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the HHDM offset. Called once, first thing in boot.
pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// The raw offset.
#[inline]
#[must_use]
pub fn offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Maps a raw physical address to its direct-map virtual address.
#[inline]
#[must_use]
pub fn virt(phys: u64) -> u64 {
    phys + offset()
}

/// Typed variant of [`virt`].
#[inline]
#[must_use]
pub fn virt_addr(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + offset())
}
