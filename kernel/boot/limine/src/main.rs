//! Limine boot stub.
//!
//! Collects the bootloader responses into the kernel's [`BootInfo`],
//! parks application CPUs through their goto-address slots, and enters
//! [`quasar_kernel::kernel_init`].

#![no_std]
#![no_main]

mod requests;

use core::sync::atomic::{AtomicU32, Ordering};

use limine::memory_map::EntryType;
use limine::smp::Cpu;

use quasar_kernel::boot::{
    self, BootInfo, FramebufferInfo, MAX_MEMORY_REGIONS, Region, RegionKind,
};
use quasar_kernel::config::MAX_CPUS;

unsafe extern "C" {
    static __kernel_end: u8;
}

fn region_kind(entry_type: EntryType) -> RegionKind {
    if entry_type == EntryType::USABLE {
        RegionKind::Usable
    } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
        RegionKind::BootloaderReclaimable
    } else if entry_type == EntryType::KERNEL_AND_MODULES {
        RegionKind::Kernel
    } else {
        RegionKind::Reserved
    }
}

/// Scheduler CPU index by LAPIC ID, filled before the goto addresses
/// are written so every AP can find its own slot.
static INDEX_BY_LAPIC: [AtomicU32; 256] = [const { AtomicU32::new(0) }; 256];

/// Entry point for application CPUs.
extern "C" fn ap_entry(cpu: &Cpu) -> ! {
    let index = INDEX_BY_LAPIC[cpu.lapic_id as usize % 256].load(Ordering::Acquire);
    boot::ap_main(index as usize, cpu.lapic_id)
}

#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    assert!(requests::BASE_REVISION.is_supported());

    let hhdm_offset = requests::HHDM
        .get_response()
        .expect("no HHDM response")
        .offset();

    // Kernel image physical extent, for the PMM's exclusion window.
    let kernel_address = requests::KERNEL_ADDRESS
        .get_response()
        .expect("no kernel address response");
    let kernel_phys_base = kernel_address.physical_base();
    let kernel_virt_base = kernel_address.virtual_base();
    // SAFETY: __kernel_end is a linker-script symbol; only its address
    // is taken.
    let kernel_end_virt = unsafe { &raw const __kernel_end } as u64;
    let kernel_phys_end = kernel_phys_base + (kernel_end_virt - kernel_virt_base);

    // Memory map.
    let mut regions = [Region {
        start: 0,
        size: 0,
        kind: RegionKind::Reserved,
    }; MAX_MEMORY_REGIONS];
    let mut region_count = 0;
    if let Some(memory_map) = requests::MEMORY_MAP.get_response() {
        for entry in memory_map.entries() {
            if region_count == MAX_MEMORY_REGIONS {
                break;
            }
            regions[region_count] = Region {
                start: entry.base,
                size: entry.length,
                kind: region_kind(entry.entry_type),
            };
            region_count += 1;
        }
    }

    // Primary framebuffer.
    let framebuffer = requests::FRAMEBUFFER
        .get_response()
        .and_then(|response| response.framebuffers().next())
        .map(|fb| FramebufferInfo {
            addr: fb.addr() as u64,
            pitch: fb.pitch(),
            width: fb.width(),
            height: fb.height(),
        });

    // CPU topology: BSP first, then park every AP through its
    // goto-address slot. They spin inside ap_main until the kernel
    // value exists.
    let mut cpu_lapic_ids = [0u32; MAX_CPUS];
    let mut cpu_count = 1;
    if let Some(smp) = requests::SMP.get_response() {
        let bsp_lapic_id = smp.bsp_lapic_id();
        cpu_lapic_ids[0] = bsp_lapic_id;
        for cpu in smp.cpus() {
            if cpu.lapic_id == bsp_lapic_id || cpu_count == MAX_CPUS {
                continue;
            }
            cpu_lapic_ids[cpu_count] = cpu.lapic_id;
            INDEX_BY_LAPIC[cpu.lapic_id as usize % 256]
                .store(cpu_count as u32, Ordering::Release);
            cpu.goto_address.write(ap_entry);
            cpu_count += 1;
        }
    }

    let info = BootInfo {
        hhdm_offset,
        kernel_phys_base,
        kernel_phys_end,
        framebuffer,
        regions,
        region_count,
        cpu_lapic_ids,
        cpu_count,
    };
    quasar_kernel::kernel_init(&info)
}
