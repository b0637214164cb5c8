//! Intel 82540EM (e1000) NIC driver.
//!
//! Legacy 16-byte descriptors over MMIO, 32-entry rings with 2 KiB DMA
//! buffers from the PMM. The IRQ handler only acknowledges the device
//! and raises a flag; received frames are drained by the net task
//! through [`quasar_net::NetDevice::recv`].

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use quasar_net::{MacAddr, NetDevice};

use crate::irq::IrqHandler;
use crate::{mm, pci};

/// PCI identity: Intel 82540EM.
const VENDOR: u16 = 0x8086;
const DEVICE: u16 = 0x100E;

// Register offsets.
const REG_CTRL: u64 = 0x0000;
const REG_EERD: u64 = 0x0014;
const REG_ICR: u64 = 0x00C0;
const REG_IMS: u64 = 0x00D0;
const REG_IMC: u64 = 0x00D8;
const REG_RCTL: u64 = 0x0100;
const REG_TCTL: u64 = 0x0400;
const REG_TIPG: u64 = 0x0410;
const REG_RDBAL: u64 = 0x2800;
const REG_RDBAH: u64 = 0x2804;
const REG_RDLEN: u64 = 0x2808;
const REG_RDH: u64 = 0x2810;
const REG_RDT: u64 = 0x2818;
const REG_TDBAL: u64 = 0x3800;
const REG_TDBAH: u64 = 0x3804;
const REG_TDLEN: u64 = 0x3808;
const REG_TDH: u64 = 0x3810;
const REG_TDT: u64 = 0x3818;
const REG_RAL0: u64 = 0x5400;
const REG_RAH0: u64 = 0x5404;

bitflags! {
    /// Receive control register bits.
    struct Rctl: u32 {
        /// Receiver enable.
        const EN = 1 << 1;
        /// Accept broadcast.
        const BAM = 1 << 15;
        /// Strip the Ethernet CRC.
        const SECRC = 1 << 26;
    }
}

bitflags! {
    /// Transmit control register bits.
    struct Tctl: u32 {
        /// Transmitter enable.
        const EN = 1 << 1;
        /// Pad short packets.
        const PSP = 1 << 3;
    }
}

/// CTRL: set link up.
const CTRL_SLU: u32 = 1 << 6;
/// CTRL: auto-speed detection.
const CTRL_ASDE: u32 = 1 << 5;
/// Interrupt causes the driver cares about (RX, TX done, link).
const IMS_ENABLE: u32 = 0x1F6;

/// Ring geometry.
const RX_RING: usize = 32;
const TX_RING: usize = 32;
const BUF_SIZE: usize = 2048;

/// Legacy receive descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct RxDesc {
    addr: u64,
    length: u16,
    checksum: u16,
    status: u8,
    errors: u8,
    special: u16,
}

/// Legacy transmit descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct TxDesc {
    addr: u64,
    length: u16,
    cso: u8,
    cmd: u8,
    status: u8,
    css: u8,
    special: u16,
}

/// Descriptor done bit (RX status / TX status).
const STAT_DD: u8 = 1 << 0;
/// TX command: end of packet + report status.
const TXCMD_EOP_RS: u8 = (1 << 0) | (1 << 3);

// The IRQ handler has no reference to the device, so the ICR address
// and the fired flag live in statics it can reach.
static ICR_ADDR: AtomicU64 = AtomicU64::new(0);
static IRQ_FIRED: AtomicBool = AtomicBool::new(false);

/// IRQ handler: acknowledge by reading ICR, flag the net task.
struct E1000Irq;

impl IrqHandler for E1000Irq {
    fn handle(&self, _irq: u8) {
        let icr = ICR_ADDR.load(Ordering::Acquire);
        if icr != 0 {
            // SAFETY: icr points at the mapped ICR register.
            unsafe { core::ptr::read_volatile(icr as *const u32) };
        }
        IRQ_FIRED.store(true, Ordering::Release);
    }
}

static E1000_IRQ: E1000Irq = E1000Irq;

/// The NIC instance.
pub struct E1000Nic {
    regs: u64,
    mac: MacAddr,
    rx_ring: *mut RxDesc,
    tx_ring: *mut TxDesc,
    rx_bufs: [u64; RX_RING],
    tx_bufs: [u64; TX_RING],
    rx_index: usize,
    tx_index: usize,
}

// SAFETY: the raw ring pointers reference PMM memory owned by this
// instance; access is serialized by the net service's lock.
unsafe impl Send for E1000Nic {}

impl E1000Nic {
    fn reg_read(&self, reg: u64) -> u32 {
        // SAFETY: regs maps the device's MMIO BAR.
        unsafe { core::ptr::read_volatile((self.regs + reg) as *const u32) }
    }

    fn reg_write(&self, reg: u64, value: u32) {
        // SAFETY: regs maps the device's MMIO BAR.
        unsafe { core::ptr::write_volatile((self.regs + reg) as *mut u32, value) };
    }

    fn eeprom_read(&self, addr: u32) -> Option<u16> {
        self.reg_write(REG_EERD, (addr << 8) | 1);
        for _ in 0..1000 {
            let value = self.reg_read(REG_EERD);
            if value & (1 << 4) != 0 {
                return Some((value >> 16) as u16);
            }
            core::hint::spin_loop();
        }
        None
    }

    fn read_mac(&self) -> Option<MacAddr> {
        let w0 = self.eeprom_read(0)?;
        let w1 = self.eeprom_read(1)?;
        let w2 = self.eeprom_read(2)?;
        Some(MacAddr([
            w0 as u8,
            (w0 >> 8) as u8,
            w1 as u8,
            (w1 >> 8) as u8,
            w2 as u8,
            (w2 >> 8) as u8,
        ]))
    }

    fn program_mac(&self) {
        let m = self.mac.0;
        let ral = u32::from(m[0])
            | (u32::from(m[1]) << 8)
            | (u32::from(m[2]) << 16)
            | (u32::from(m[3]) << 24);
        let rah = u32::from(m[4]) | (u32::from(m[5]) << 8) | (1 << 31);
        self.reg_write(REG_RAL0, ral);
        self.reg_write(REG_RAH0, rah);
    }

    fn init_rx(&mut self) -> Option<()> {
        let ring_bytes = RX_RING * size_of::<RxDesc>();
        let (ring_virt, ring_phys) = mm::alloc_dma_zeroed(ring_bytes as u64, 16)?;
        self.rx_ring = ring_virt.as_mut_ptr();

        for i in 0..RX_RING {
            let (_, buf_phys) = mm::alloc_dma(BUF_SIZE as u64, 16)?;
            self.rx_bufs[i] = buf_phys.as_u64();
            // SAFETY: i indexes the freshly allocated ring.
            unsafe {
                let desc = &mut *self.rx_ring.add(i);
                desc.addr = buf_phys.as_u64();
                desc.status = 0;
            }
        }

        self.reg_write(REG_RDBAL, ring_phys.as_u64() as u32);
        self.reg_write(REG_RDBAH, (ring_phys.as_u64() >> 32) as u32);
        self.reg_write(REG_RDLEN, ring_bytes as u32);
        self.reg_write(REG_RDH, 0);
        self.reg_write(REG_RDT, (RX_RING - 1) as u32);
        self.rx_index = 0;

        self.reg_write(REG_RCTL, (Rctl::EN | Rctl::BAM | Rctl::SECRC).bits());
        Some(())
    }

    fn init_tx(&mut self) -> Option<()> {
        let ring_bytes = TX_RING * size_of::<TxDesc>();
        let (ring_virt, ring_phys) = mm::alloc_dma_zeroed(ring_bytes as u64, 16)?;
        self.tx_ring = ring_virt.as_mut_ptr();

        for i in 0..TX_RING {
            let (_, buf_phys) = mm::alloc_dma(BUF_SIZE as u64, 16)?;
            self.tx_bufs[i] = buf_phys.as_u64();
            // SAFETY: i indexes the freshly allocated ring.
            unsafe {
                let desc = &mut *self.tx_ring.add(i);
                desc.addr = buf_phys.as_u64();
                desc.status = STAT_DD; // available
            }
        }

        self.reg_write(REG_TDBAL, ring_phys.as_u64() as u32);
        self.reg_write(REG_TDBAH, (ring_phys.as_u64() >> 32) as u32);
        self.reg_write(REG_TDLEN, ring_bytes as u32);
        self.reg_write(REG_TDH, 0);
        self.reg_write(REG_TDT, 0);
        self.tx_index = 0;

        // Collision threshold 0x10, distance 0x40, standard IPG.
        let tctl = (Tctl::EN | Tctl::PSP).bits() | (0x10 << 4) | (0x40 << 12);
        self.reg_write(REG_TCTL, tctl);
        self.reg_write(REG_TIPG, 0x0060_200A);
        Some(())
    }

    /// Finds the NIC on the PCI bus and brings it up. Returns `None`
    /// when absent or when DMA memory runs out.
    pub fn probe() -> Option<Self> {
        let dev = pci::find_device(VENDOR, DEVICE)?;
        pci::enable_bus_master(&dev);

        let pci::Bar::Memory(bar0) = dev.bar(0)? else {
            crate::kwarn!("e1000: BAR0 is not memory space");
            return None;
        };

        let mut nic = Self {
            regs: mm::hhdm::virt(bar0),
            mac: MacAddr::ZERO,
            rx_ring: core::ptr::null_mut(),
            tx_ring: core::ptr::null_mut(),
            rx_bufs: [0; RX_RING],
            tx_bufs: [0; TX_RING],
            rx_index: 0,
            tx_index: 0,
        };

        let Some(mac) = nic.read_mac() else {
            crate::kwarn!("e1000: EEPROM read timed out");
            return None;
        };
        nic.mac = mac;
        nic.program_mac();

        nic.reg_write(REG_CTRL, nic.reg_read(REG_CTRL) | CTRL_SLU | CTRL_ASDE);

        // Quiesce interrupts during ring setup.
        nic.reg_write(REG_IMC, u32::MAX);
        let _ = nic.reg_read(REG_ICR);

        nic.init_rx()?;
        nic.init_tx()?;

        ICR_ADDR.store(nic.regs + REG_ICR, Ordering::Release);
        crate::kernel::kernel().irq.register(dev.irq_line, &E1000_IRQ);
        crate::drivers::pic::unmask(dev.irq_line);
        nic.reg_write(REG_IMS, IMS_ENABLE);

        crate::kinfo!("e1000: up, mac={} irq={}", nic.mac, dev.irq_line);
        Some(nic)
    }
}

impl NetDevice for E1000Nic {
    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn send(&mut self, frame: &[u8]) -> bool {
        if frame.is_empty() || frame.len() > BUF_SIZE {
            return false;
        }
        let i = self.tx_index;
        // SAFETY: i stays within the ring.
        let desc = unsafe { &mut *self.tx_ring.add(i) };
        if desc.status & STAT_DD == 0 {
            return false; // ring full
        }

        let buf = mm::hhdm::virt(self.tx_bufs[i]) as *mut u8;
        // SAFETY: the buffer is a BUF_SIZE DMA region owned by slot i,
        // and the DD check above says the device is done with it.
        unsafe { core::ptr::copy_nonoverlapping(frame.as_ptr(), buf, frame.len()) };

        desc.length = frame.len() as u16;
        desc.cmd = TXCMD_EOP_RS;
        desc.status = 0;

        self.tx_index = (i + 1) % TX_RING;
        self.reg_write(REG_TDT, self.tx_index as u32);
        true
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        IRQ_FIRED.store(false, Ordering::Release);
        let i = self.rx_index;
        // SAFETY: i stays within the ring.
        let desc = unsafe { &mut *self.rx_ring.add(i) };
        if desc.status & STAT_DD == 0 {
            return None;
        }

        let len = usize::from(desc.length).min(buf.len());
        let src = mm::hhdm::virt(self.rx_bufs[i]) as *const u8;
        // SAFETY: the device wrote `length` bytes into slot i's buffer.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len) };

        // Hand the descriptor back and advance the tail past it.
        desc.status = 0;
        self.reg_write(REG_RDT, i as u32);
        self.rx_index = (i + 1) % RX_RING;
        Some(len)
    }
}
