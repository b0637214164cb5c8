//! Block-list kernel heap.
//!
//! A singly linked list of `{size, free, next}` headers embedded in one
//! statically reserved arena. Best-fit allocation with block splitting,
//! pairwise forward coalescing on free, and in-place `realloc` when the
//! neighbor allows it. The [`LockedHeap`] wrapper implements
//! [`GlobalAlloc`] so the kernel gets `alloc::vec::Vec` and friends.
//!
//! List invariants (checked by [`Heap::integrity`]):
//! - the block chain tiles the arena exactly once;
//! - no two adjacent blocks are both free;
//! - every block size is a multiple of the heap granularity.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use quasar_core::sync::SpinLock;

/// Allocation granularity. Sizes round up to this and every payload is
/// aligned to it, which covers all kernel types up to SSE vectors.
pub const GRANULE: usize = 16;

/// Block header preceding every payload in the arena.
#[repr(C, align(16))]
struct Block {
    /// Payload bytes that follow this header.
    size: usize,
    /// Whether the payload is currently unallocated.
    free: bool,
    /// Next block by address, or null for the arena's last block.
    next: *mut Block,
}

/// Header size; payload follows immediately after.
const HEADER: usize = size_of::<Block>();

const _: () = assert!(HEADER % GRANULE == 0);

#[inline]
const fn round_up(size: usize) -> usize {
    (size + GRANULE - 1) & !(GRANULE - 1)
}

/// Gross allocation counters. `allocated` and `freed` only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total payload bytes handed out over the heap's lifetime.
    pub allocated: u64,
    /// Total payload bytes returned over the heap's lifetime.
    pub freed: u64,
    /// Current number of blocks in the list.
    pub blocks: u64,
}

/// Snapshot of the list structure, used by tests and debug assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    /// Header plus payload bytes reachable from the list head.
    pub covered: usize,
    /// Number of blocks walked.
    pub blocks: u64,
    /// Whether any block is followed by another free block.
    pub adjacent_free: bool,
}

/// The allocator itself. Not thread-safe; see [`LockedHeap`].
pub struct Heap {
    head: *mut Block,
    arena_size: usize,
    stats: HeapStats,
}

// SAFETY: the raw block pointers all point into the arena the heap was
// initialized over; moving the Heap between threads moves ownership of
// that arena with it.
unsafe impl Send for Heap {}

impl Heap {
    /// Creates a heap with no arena. Every allocation fails until
    /// [`init`](Self::init) runs.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            arena_size: 0,
            stats: HeapStats {
                allocated: 0,
                freed: 0,
                blocks: 0,
            },
        }
    }

    /// Adopts `arena` as the backing storage: one big free block.
    ///
    /// # Safety
    ///
    /// `arena` must be valid for reads and writes of `size` bytes,
    /// aligned to [`GRANULE`], unused by anything else, and outlive the
    /// heap. Must be called exactly once.
    pub unsafe fn init(&mut self, arena: *mut u8, size: usize) {
        debug_assert!(self.head.is_null(), "heap already initialized");
        debug_assert!(arena as usize % GRANULE == 0);
        debug_assert!(size > HEADER);

        let head = arena.cast::<Block>();
        // SAFETY: caller guarantees the arena covers at least one header.
        unsafe {
            (*head).size = size - HEADER;
            (*head).free = true;
            (*head).next = ptr::null_mut();
        }
        self.head = head;
        self.arena_size = size;
        self.stats.blocks = 1;
    }

    /// Allocates `size` bytes, best-fit. Returns null on exhaustion.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.head.is_null() {
            return ptr::null_mut();
        }
        let size = round_up(size);

        let mut best: *mut Block = ptr::null_mut();
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: current came from the list, which only holds
            // pointers into the arena.
            let blk = unsafe { &*current };
            if blk.free && blk.size >= size {
                let better = best.is_null() || blk.size < unsafe { (*best).size };
                if better {
                    best = current;
                    if blk.size == size {
                        break;
                    }
                }
            }
            current = blk.next;
        }

        if best.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: best points at a free block large enough for `size`.
        unsafe {
            self.split(best, size);
            (*best).free = false;
            self.stats.allocated += (*best).size as u64;
            best.cast::<u8>().add(HEADER)
        }
    }

    /// Allocates a zeroed array of `count` elements of `size` bytes,
    /// failing on multiplication overflow.
    pub fn alloc_zeroed_array(&mut self, count: usize, size: usize) -> *mut u8 {
        if count == 0 || size == 0 {
            return ptr::null_mut();
        }
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let ptr = self.alloc(total);
        if !ptr.is_null() {
            // SAFETY: alloc returned a block with at least `total` bytes.
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Returns `ptr`'s block to the free list and coalesces.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap's `alloc`/`realloc` and must not
    /// have been freed already.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: per contract, a header precedes every payload.
        let block = unsafe { &mut *ptr.sub(HEADER).cast::<Block>() };
        debug_assert!(!block.free, "double free");
        block.free = true;
        self.stats.freed += block.size as u64;
        self.coalesce();
    }

    /// Resizes the allocation at `ptr` to `size` bytes.
    ///
    /// Shrinks in place, grows in place by absorbing a free successor,
    /// or falls back to alloc+copy+free. Returns null (leaving the old
    /// allocation intact) when no memory is available.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for non-null `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }
        let size = round_up(size);
        // SAFETY: per contract, ptr was produced by this heap, so a
        // header precedes it.
        let block_ptr = unsafe { ptr.sub(HEADER).cast::<Block>() };
        // SAFETY: block_ptr points at that live header.
        let old_size = unsafe { (*block_ptr).size };

        if old_size >= size {
            // SAFETY: block_ptr is a live allocated block.
            unsafe {
                let before = (*block_ptr).size;
                self.split(block_ptr, size);
                self.stats.freed += (before - (*block_ptr).size) as u64;
            }
            self.coalesce();
            return ptr;
        }

        // SAFETY: block_ptr is live; next pointers stay inside the arena.
        unsafe {
            let next = (*block_ptr).next;
            if !next.is_null()
                && (*next).free
                && old_size + HEADER + (*next).size >= size
            {
                (*block_ptr).size = old_size + HEADER + (*next).size;
                (*block_ptr).next = (*next).next;
                self.stats.blocks -= 1;
                self.split(block_ptr, size);
                self.stats.allocated += ((*block_ptr).size - old_size) as u64;
                return ptr;
            }
        }

        let new_ptr = self.alloc(size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both pointers are valid for old_size.min(size) bytes
        // and belong to distinct blocks.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
            self.free(ptr);
        }
        new_ptr
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Walks the list and reports its structure.
    #[must_use]
    pub fn integrity(&self) -> HeapLayout {
        let mut covered = 0usize;
        let mut blocks = 0u64;
        let mut adjacent_free = false;
        let mut prev_free = false;
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: list pointers stay inside the arena.
            let blk = unsafe { &*current };
            covered += HEADER + blk.size;
            blocks += 1;
            if prev_free && blk.free {
                adjacent_free = true;
            }
            prev_free = blk.free;
            current = blk.next;
        }
        HeapLayout {
            covered,
            blocks,
            adjacent_free,
        }
    }

    /// Splits `block` so its payload becomes exactly `size` bytes,
    /// when the remainder can hold a header plus one granule.
    ///
    /// # Safety
    ///
    /// `block` must be a live block with `size <= block.size`.
    unsafe fn split(&mut self, block: *mut Block, size: usize) {
        // SAFETY: caller guarantees block validity.
        unsafe {
            if (*block).size >= size + HEADER + GRANULE {
                let rest = block.cast::<u8>().add(HEADER + size).cast::<Block>();
                (*rest).size = (*block).size - size - HEADER;
                (*rest).free = true;
                (*rest).next = (*block).next;
                (*block).next = rest;
                (*block).size = size;
                self.stats.blocks += 1;
            }
        }
    }

    /// One forward pass merging each free block with free successors.
    fn coalesce(&mut self) {
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: list pointers stay inside the arena.
            unsafe {
                let next = (*current).next;
                if !next.is_null() && (*current).free && (*next).free {
                    (*current).size += HEADER + (*next).size;
                    (*current).next = (*next).next;
                    self.stats.blocks -= 1;
                    // Stay on `current`: the new successor may be free too.
                } else {
                    current = next;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GlobalAlloc adapter
// ---------------------------------------------------------------------------

/// Spin-locked heap suitable for `#[global_allocator]`.
pub struct LockedHeap {
    inner: SpinLock<Heap>,
}

impl LockedHeap {
    /// Creates an adapter around an uninitialized heap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Heap::empty()),
        }
    }

    /// Initializes the backing heap. See [`Heap::init`] for the contract.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::init`].
    pub unsafe fn init(&self, arena: *mut u8, size: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.lock().init(arena, size) };
    }

    /// Current counters.
    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: alloc/dealloc honor the GlobalAlloc contract; alignment is
// bounded by GRANULE, and larger alignments are reported as failure
// (null) rather than misaligned memory.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > GRANULE {
            return ptr::null_mut();
        }
        self.inner.lock().alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: GlobalAlloc guarantees ptr came from alloc.
        unsafe { self.inner.lock().free(ptr) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > GRANULE {
            return ptr::null_mut();
        }
        // SAFETY: GlobalAlloc guarantees ptr came from alloc.
        unsafe { self.inner.lock().realloc(ptr, new_size) }
    }
}
