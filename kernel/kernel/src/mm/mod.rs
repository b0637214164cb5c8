//! Kernel memory wiring: the HHDM offset, the static heap arena, and
//! the global PMM instance with its DMA helper.

pub mod hhdm;

use core::cell::UnsafeCell;

use quasar_core::addr::{PhysAddr, VirtAddr};
use quasar_core::sync::SpinLock;
use quasar_mm::heap::{HeapStats, LockedHeap};
use quasar_mm::pmm::{BumpAllocator, Region, page_stats};

use crate::config::HEAP_SIZE;

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// The statically reserved heap arena.
#[repr(C, align(4096))]
struct Arena(UnsafeCell<[u8; HEAP_SIZE]>);

// SAFETY: the arena is only touched through the locked heap.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; HEAP_SIZE]));

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::new();

/// Hands the arena to the global allocator.
///
/// # Safety
///
/// Must run exactly once, before the first allocation.
pub unsafe fn init_heap() {
    // SAFETY: the arena is static, page-aligned, and unused elsewhere.
    unsafe { HEAP.init(ARENA.0.get().cast(), HEAP_SIZE) };
    crate::kinfo!("mm: heap arena of {} KiB ready", HEAP_SIZE / 1024);
}

/// Current heap counters.
#[must_use]
pub fn heap_stats() -> HeapStats {
    HEAP.stats()
}

// ---------------------------------------------------------------------------
// PMM
// ---------------------------------------------------------------------------

static PMM: SpinLock<Option<BumpAllocator>> = SpinLock::new(None);

/// Configures the physical allocator from the boot memory map.
pub fn init_pmm(regions: &[Region], kernel_phys_base: u64, kernel_phys_end: u64) {
    let stats = page_stats(regions);
    crate::kinfo!(
        "mm: {} pages total, {} usable, {} reserved",
        stats.total,
        stats.free,
        stats.used
    );

    match BumpAllocator::configure(regions, kernel_phys_base, kernel_phys_end) {
        Some(pmm) => {
            crate::kinfo!(
                "mm: pmm window {:#x}..{:#x} ({} KiB)",
                pmm.base(),
                pmm.end(),
                pmm.remaining() / 1024
            );
            *PMM.lock() = Some(pmm);
        }
        None => crate::kerr!("mm: no usable physical region for the pmm"),
    }
}

/// Allocates physically contiguous, HHDM-mapped memory for DMA.
///
/// Returns the virtual mapping and the physical address. The memory is
/// never reclaimed.
pub fn alloc_dma(size: u64, align: u64) -> Option<(VirtAddr, PhysAddr)> {
    let phys = PMM.lock().as_mut()?.alloc(size, align)?;
    Some((hhdm::virt_addr(phys), phys))
}

/// Like [`alloc_dma`], but zero-filled.
pub fn alloc_dma_zeroed(size: u64, align: u64) -> Option<(VirtAddr, PhysAddr)> {
    let (virt, phys) = alloc_dma(size, align)?;
    // SAFETY: the region was just carved out of the PMM for us.
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, size as usize) };
    Some((virt, phys))
}
