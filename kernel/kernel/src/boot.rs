//! Boot handoff types and the kernel initialization sequence.
//!
//! The bootloader-specific stub (Limine) collects its responses into a
//! [`BootInfo`] and calls [`kernel_init`] on the BSP; application CPUs
//! land in [`ap_main`] through their goto-address slots.

use core::sync::atomic::{AtomicBool, Ordering};

pub use quasar_mm::pmm::{Region, RegionKind};

use crate::arch::x86_64::{instructions, interrupts};
use crate::config::{MAX_CPUS, PIT_HZ};
use crate::drivers::{i8042, lapic};
use crate::{kernel, log, mm, net, percpu, services, time};

/// Upper bound on memory map entries carried in [`BootInfo`].
pub const MAX_MEMORY_REGIONS: usize = 128;

/// The boot framebuffer, already HHDM-mapped.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of pixel memory.
    pub addr: u64,
    /// Bytes per scanline.
    pub pitch: u64,
    /// Width in pixels.
    pub width: u64,
    /// Height in pixels.
    pub height: u64,
}

/// Everything the kernel needs from the bootloader.
pub struct BootInfo {
    /// Higher-half direct map offset.
    pub hhdm_offset: u64,
    /// Physical range of the loaded kernel image.
    pub kernel_phys_base: u64,
    /// One past the last physical byte of the image.
    pub kernel_phys_end: u64,
    /// Primary framebuffer, when one exists.
    pub framebuffer: Option<FramebufferInfo>,
    /// Physical memory map.
    pub regions: [Region; MAX_MEMORY_REGIONS],
    /// Live entries in `regions`.
    pub region_count: usize,
    /// LAPIC IDs of all CPUs, BSP first.
    pub cpu_lapic_ids: [u32; MAX_CPUS],
    /// Live entries in `cpu_lapic_ids`.
    pub cpu_count: usize,
}

/// Application CPUs spin here until the BSP has built the kernel
/// value; the boot stub releases them into [`ap_main`] long before the
/// scheduler exists.
static AP_GATE: AtomicBool = AtomicBool::new(false);

/// Body of the `desktop` task: drive the registered collaborator, or
/// sleep when none is installed.
extern "C" fn desktop_task(_arg: usize) {
    let kernel = kernel::kernel();
    if let Some(desktop) = services::desktop() {
        desktop.init();
        loop {
            desktop.frame();
            kernel.sched.yield_now();
        }
    }
    crate::kwarn!("desktop: no collaborator registered");
    loop {
        kernel.sched.sleep(PIT_HZ);
    }
}

/// Full BSP bring-up. Never returns: ends inside the scheduler.
pub fn kernel_init(info: &BootInfo) -> ! {
    log::init_early();
    crate::kinfo!("quasar: booting");

    mm::hhdm::init(info.hhdm_offset);
    // SAFETY: runs once, before any allocation.
    unsafe { mm::init_heap() };
    mm::init_pmm(
        &info.regions[..info.region_count],
        info.kernel_phys_base,
        info.kernel_phys_end,
    );

    let cpu_count = info.cpu_count.clamp(1, MAX_CPUS);
    for (index, &lapic_id) in info.cpu_lapic_ids[..cpu_count].iter().enumerate() {
        percpu::register_cpu(lapic_id, index as u32);
    }

    let vendor = instructions::cpuid::vendor();
    crate::kinfo!(
        "cpu: {} x {}",
        cpu_count,
        core::str::from_utf8(&vendor).unwrap_or("unknown")
    );

    // SAFETY: early boot, single CPU, interrupts still disabled.
    unsafe { interrupts::init() };
    // SAFETY: the PIT tick is live, required for timer calibration.
    unsafe { lapic::init_bsp() };

    let kernel = kernel::init(cpu_count);

    kernel.storage.init();
    kernel.net.init();
    i8042::init();

    kernel
        .sched
        .spawn("desktop", desktop_task, 0)
        .expect("spawn desktop task");
    kernel
        .sched
        .spawn("net", net::net_task, 0)
        .expect("spawn net task");

    AP_GATE.store(true, Ordering::Release);

    lapic::start_timer(PIT_HZ as u32);
    crate::kinfo!("quasar: entering scheduler after {} ticks", time::ticks());
    kernel.sched.start_bsp()
}

/// Application CPU bring-up; called from the boot stub on the AP's own
/// stack. Never returns.
pub fn ap_main(cpu_index: usize, lapic_id: u32) -> ! {
    while !AP_GATE.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
    percpu::register_cpu(lapic_id, cpu_index as u32);
    // SAFETY: the BSP finished interrupts::init before parking APs.
    unsafe {
        interrupts::init_ap();
        lapic::init_ap();
    }
    lapic::start_timer(PIT_HZ as u32);
    crate::kinfo!("cpu{}: online (lapic {})", cpu_index, lapic_id);
    kernel::kernel().sched.start_ap(cpu_index)
}
