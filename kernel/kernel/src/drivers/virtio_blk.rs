//! Virtio block device over the legacy I/O-port transport.
//!
//! One split virtqueue (capped at 8 entries), three-descriptor request
//! chains (header, data, status), and a 4 KiB bounce buffer, so each
//! request moves at most 8 sectors. Completion is polled through the
//! ISR register; the device is fast enough that waiting beats wiring
//! an interrupt for the single consumer.

use quasar_fs::{BlockDevice, IoError, SECTOR_SIZE};

use crate::arch::x86_64::Port;
use crate::{mm, pci};

/// PCI identity: virtio-blk (legacy).
const VENDOR: u16 = 0x1AF4;
const DEVICE: u16 = 0x1001;

// Legacy I/O register offsets.
const REG_QUEUE_ADDRESS: u16 = 0x08;
const REG_QUEUE_SIZE: u16 = 0x0C;
const REG_QUEUE_SELECT: u16 = 0x0E;
const REG_QUEUE_NOTIFY: u16 = 0x10;
const REG_STATUS: u16 = 0x12;
const REG_ISR: u16 = 0x13;
const REG_CONFIG: u16 = 0x14;

// Device status bits.
const STATUS_ACK: u8 = 0x01;
const STATUS_DRIVER: u8 = 0x02;
const STATUS_DRIVER_OK: u8 = 0x04;

// Request types.
const REQ_READ: u32 = 0;
const REQ_WRITE: u32 = 1;

// Descriptor flags.
const DESC_NEXT: u16 = 1;
const DESC_WRITE: u16 = 2;

/// Queue size cap; three descriptors per request leaves headroom.
const MAX_QUEUE: u16 = 8;

/// Bounce buffer size, and so the per-request transfer cap.
const BOUNCE_SIZE: usize = 4096;
/// Sectors per request.
const CHUNK_SECTORS: u32 = (BOUNCE_SIZE / SECTOR_SIZE) as u32;

/// Split-queue descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

/// Request header preceding the data buffer.
#[repr(C)]
struct RequestHeader {
    kind: u32,
    _reserved: u32,
    sector: u64,
}

/// The virtio block device.
pub struct VirtioBlk {
    io_base: u16,
    queue_size: u16,
    desc: *mut VirtqDesc,
    avail: *mut u8,
    used: *mut u8,
    last_used: u16,
    header: *mut RequestHeader,
    header_phys: u64,
    status: *mut u8,
    status_phys: u64,
    bounce: *mut u8,
    bounce_phys: u64,
    capacity_sectors: u64,
}

// SAFETY: the raw pointers reference PMM memory owned by this
// instance; the storage service serializes access.
unsafe impl Send for VirtioBlk {}

impl VirtioBlk {
    fn io8(&self, offset: u16) -> Port<u8> {
        Port::new(self.io_base + offset)
    }

    fn io16(&self, offset: u16) -> Port<u16> {
        Port::new(self.io_base + offset)
    }

    fn io32(&self, offset: u16) -> Port<u32> {
        Port::new(self.io_base + offset)
    }

    /// Finds and initializes the device. Returns `None` when absent,
    /// when its BAR is not I/O space, or when DMA memory runs out.
    pub fn probe() -> Option<Self> {
        let dev = pci::find_device(VENDOR, DEVICE)?;
        pci::enable_bus_master(&dev);
        let pci::Bar::Io(io_base) = dev.bar(0)? else {
            crate::kwarn!("virtio-blk: BAR0 is not I/O space");
            return None;
        };

        let mut blk = Self {
            io_base,
            queue_size: 0,
            desc: core::ptr::null_mut(),
            avail: core::ptr::null_mut(),
            used: core::ptr::null_mut(),
            last_used: 0,
            header: core::ptr::null_mut(),
            header_phys: 0,
            status: core::ptr::null_mut(),
            status_phys: 0,
            bounce: core::ptr::null_mut(),
            bounce_phys: 0,
            capacity_sectors: 0,
        };

        // SAFETY: legacy virtio initialization over the device's ports.
        unsafe {
            blk.io8(REG_STATUS).write(0); // reset
            blk.io8(REG_STATUS).write(STATUS_ACK | STATUS_DRIVER);
            blk.io16(REG_QUEUE_SELECT).write(0);
        }

        // SAFETY: reading the device-supplied queue size.
        let device_queue = unsafe { blk.io16(REG_QUEUE_SIZE).read() };
        if device_queue == 0 {
            return None;
        }
        blk.queue_size = device_queue.min(MAX_QUEUE);

        blk.setup_queue()?;
        blk.setup_buffers()?;

        // SAFETY: capacity lives at config offset 0 as two dwords.
        blk.capacity_sectors = unsafe {
            let lo = blk.io32(REG_CONFIG).read();
            let hi = Port::<u32>::new(blk.io_base + REG_CONFIG + 4).read();
            (u64::from(hi) << 32) | u64::from(lo)
        };

        // SAFETY: final handshake bit.
        unsafe {
            let status = blk.io8(REG_STATUS).read();
            blk.io8(REG_STATUS).write(status | STATUS_DRIVER_OK);
        }

        crate::kinfo!(
            "virtio-blk: {} MiB, queue size {}",
            blk.capacity_sectors * SECTOR_SIZE as u64 / (1024 * 1024),
            blk.queue_size
        );
        Some(blk)
    }

    /// Lays out descriptor table + available ring + used ring in one
    /// physically contiguous region and hands it to the device.
    fn setup_queue(&mut self) -> Option<()> {
        let qs = usize::from(self.queue_size);
        let desc_bytes = qs * size_of::<VirtqDesc>();
        let avail_bytes = 4 + 2 * qs; // flags + idx + ring
        let used_bytes = 4 + 8 * qs; // flags + idx + ring of {id, len}

        let avail_off = desc_bytes; // descriptors are 16-byte, already 2-aligned
        let used_off = (avail_off + avail_bytes + 3) & !3;
        let total = used_off + used_bytes;

        let (virt, phys) = mm::alloc_dma_zeroed(total as u64, 4096)?;
        self.desc = virt.as_mut_ptr();
        // SAFETY: offsets stay inside the allocation.
        unsafe {
            self.avail = virt.as_mut_ptr::<u8>().add(avail_off);
            self.used = virt.as_mut_ptr::<u8>().add(used_off);
        }
        self.last_used = 0;

        // The legacy transport takes the page frame number.
        // SAFETY: handing the queue region to the device.
        unsafe {
            self.io32(REG_QUEUE_ADDRESS)
                .write((phys.as_u64() / 4096) as u32);
        }
        Some(())
    }

    fn setup_buffers(&mut self) -> Option<()> {
        let (virt, phys) = mm::alloc_dma_zeroed(size_of::<RequestHeader>() as u64, 16)?;
        self.header = virt.as_mut_ptr();
        self.header_phys = phys.as_u64();

        let (virt, phys) = mm::alloc_dma_zeroed(1, 1)?;
        self.status = virt.as_mut_ptr();
        self.status_phys = phys.as_u64();

        let (virt, phys) = mm::alloc_dma_zeroed(BOUNCE_SIZE as u64, 16)?;
        self.bounce = virt.as_mut_ptr();
        self.bounce_phys = phys.as_u64();
        Some(())
    }

    /// Total device capacity in sectors.
    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    /// Submits one request of up to [`CHUNK_SECTORS`] sectors through
    /// the bounce buffer and polls for completion.
    fn submit(&mut self, write: bool, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), IoError> {
        if self.desc.is_null() {
            return Err(IoError::NotReady);
        }
        let bytes = count as usize * SECTOR_SIZE;
        debug_assert!(bytes <= BOUNCE_SIZE && bytes <= buf.len());

        // SAFETY: header/status/bounce are live DMA allocations.
        unsafe {
            (*self.header).kind = if write { REQ_WRITE } else { REQ_READ };
            (*self.header)._reserved = 0;
            (*self.header).sector = lba;
            *self.status = 0xFF;
            if write {
                core::ptr::copy_nonoverlapping(buf.as_ptr(), self.bounce, bytes);
            }
        }

        // Three-descriptor chain: header, data, status byte.
        // SAFETY: indices 0..3 are within the (>= 8 entry) table.
        unsafe {
            *self.desc.add(0) = VirtqDesc {
                addr: self.header_phys,
                len: size_of::<RequestHeader>() as u32,
                flags: DESC_NEXT,
                next: 1,
            };
            *self.desc.add(1) = VirtqDesc {
                addr: self.bounce_phys,
                len: bytes as u32,
                flags: DESC_NEXT | if write { 0 } else { DESC_WRITE },
                next: 2,
            };
            *self.desc.add(2) = VirtqDesc {
                addr: self.status_phys,
                len: 1,
                flags: DESC_WRITE,
                next: 0,
            };
        }

        // Publish chain head 0 on the available ring.
        // SAFETY: avail ring offsets computed in setup_queue.
        unsafe {
            let idx_ptr = self.avail.add(2).cast::<u16>();
            let idx = core::ptr::read_volatile(idx_ptr);
            let slot = self.avail.add(4 + 2 * usize::from(idx % self.queue_size)).cast::<u16>();
            core::ptr::write_volatile(slot, 0);
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
            core::ptr::write_volatile(idx_ptr, idx.wrapping_add(1));
        }

        // SAFETY: kick queue 0.
        unsafe { self.io16(REG_QUEUE_NOTIFY).write(0) };

        // Poll the used ring; reading ISR keeps a masked interrupt from
        // staying latched.
        loop {
            // SAFETY: used ring offsets computed in setup_queue.
            let used_idx = unsafe { core::ptr::read_volatile(self.used.add(2).cast::<u16>()) };
            if used_idx != self.last_used {
                self.last_used = used_idx;
                break;
            }
            // SAFETY: ISR register read clears the interrupt latch.
            unsafe { self.io8(REG_ISR).read() };
            core::hint::spin_loop();
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);

        // SAFETY: the device wrote the status byte.
        if unsafe { *self.status } != 0 {
            return Err(IoError::Device);
        }
        if !write {
            // SAFETY: the device filled the bounce buffer.
            unsafe { core::ptr::copy_nonoverlapping(self.bounce, buf.as_mut_ptr(), bytes) };
        }
        Ok(())
    }

    /// Reads `count` sectors starting at `lba`, chunked through the
    /// bounce buffer.
    pub fn read(&mut self, mut lba: u64, mut count: u32, buf: &mut [u8]) -> Result<(), IoError> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err(IoError::OutOfRange);
        }
        let mut offset = 0usize;
        while count > 0 {
            let chunk = count.min(CHUNK_SECTORS);
            let bytes = chunk as usize * SECTOR_SIZE;
            self.submit(false, lba, chunk, &mut buf[offset..offset + bytes])?;
            lba += u64::from(chunk);
            count -= chunk;
            offset += bytes;
        }
        Ok(())
    }

    /// Writes `count` sectors starting at `lba`.
    pub fn write(&mut self, mut lba: u64, mut count: u32, buf: &[u8]) -> Result<(), IoError> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err(IoError::OutOfRange);
        }
        let mut chunk_buf = [0u8; BOUNCE_SIZE];
        let mut offset = 0usize;
        while count > 0 {
            let chunk = count.min(CHUNK_SECTORS);
            let bytes = chunk as usize * SECTOR_SIZE;
            chunk_buf[..bytes].copy_from_slice(&buf[offset..offset + bytes]);
            self.submit(true, lba, chunk, &mut chunk_buf[..bytes])?;
            lba += u64::from(chunk);
            count -= chunk;
            offset += bytes;
        }
        Ok(())
    }
}

impl BlockDevice for VirtioBlk {
    fn read_sector(&mut self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), IoError> {
        self.read(lba, 1, buf)
    }

    fn write_sector(&mut self, lba: u64, buf: &[u8; SECTOR_SIZE]) -> Result<(), IoError> {
        self.write(lba, 1, buf)
    }
}
