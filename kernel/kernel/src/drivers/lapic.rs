//! Local APIC: enable, EOI, and the calibrated scheduler timer.
//!
//! Each CPU maps the same physical LAPIC page through the HHDM. The
//! timer rate is never guessed: the BSP measures the LAPIC timer
//! against one PIT second before the periodic mode is armed.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch::x86_64::instructions::msr;
use crate::config::{PIT_HZ, SCHED_VECTOR};
use crate::mm::hhdm;

const REG_ID: u64 = 0x020;
const REG_TPR: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_SVR: u64 = 0x0F0;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// Spurious interrupt vector.
const SPURIOUS_VECTOR: u32 = 0xFF;
/// LVT timer periodic mode.
const TIMER_PERIODIC: u32 = 1 << 17;
/// Divide configuration encoding for divide-by-16.
const DIVIDE_BY_16: u32 = 0b0011;
/// Global-enable bit in `IA32_APIC_BASE`.
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

/// Fallback timer rate when calibration reads zero (a broken
/// hypervisor timer); roughly a 100 MHz bus.
const FALLBACK_TICKS_PER_SEC: u32 = 100_000_000;

/// Virtual base of the LAPIC MMIO page; 0 until mapped.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);
/// Measured LAPIC timer ticks per second (divide-by-16 applied).
static TIMER_TICKS_PER_SEC: AtomicU32 = AtomicU32::new(0);

fn read(reg: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return 0;
    }
    // SAFETY: base maps the 4 KiB LAPIC register page.
    unsafe { core::ptr::read_volatile((base + reg) as *const u32) }
}

fn write(reg: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    // SAFETY: base maps the 4 KiB LAPIC register page.
    unsafe { core::ptr::write_volatile((base + reg) as *mut u32, value) };
}

/// Globally enables the LAPIC via the base MSR and maps its registers.
unsafe fn map_and_enable() {
    // SAFETY: IA32_APIC_BASE is architecturally defined.
    let base = unsafe { msr::rdmsr(msr::IA32_APIC_BASE) };
    // SAFETY: setting the global-enable bit of the same MSR.
    unsafe { msr::wrmsr(msr::IA32_APIC_BASE, base | APIC_GLOBAL_ENABLE) };
    let phys = base & 0xFFFF_F000;
    LAPIC_BASE.store(hhdm::virt(phys), Ordering::Release);
}

/// This CPU's LAPIC ID.
#[must_use]
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

/// Signals end-of-interrupt for a LAPIC-delivered vector.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// `extern "C"` EOI entry for the scheduler vector's naked stub.
pub extern "C" fn eoi_current() {
    eoi();
}

/// Measures the LAPIC timer against the PIT: free-run the timer for
/// one PIT second and read back how far it counted.
fn calibrate() {
    if TIMER_TICKS_PER_SEC.load(Ordering::Relaxed) != 0 {
        return;
    }
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, u32::from(SCHED_VECTOR));
    write(REG_TIMER_INITIAL, u32::MAX);

    // Align to a tick edge, then wait a full second of PIT ticks.
    let start = crate::time::ticks();
    while crate::time::ticks() == start {
        core::hint::spin_loop();
    }
    let start = crate::time::ticks();
    while crate::time::ticks() - start < PIT_HZ {
        core::hint::spin_loop();
    }

    let counted = u32::MAX - read(REG_TIMER_CURRENT);
    let rate = if counted == 0 {
        FALLBACK_TICKS_PER_SEC
    } else {
        counted
    };
    TIMER_TICKS_PER_SEC.store(rate, Ordering::Relaxed);
    crate::kinfo!("lapic: timer runs at {} ticks/s (div 16)", rate);
}

/// Arms this CPU's timer to raise the scheduler vector `hz` times per
/// second.
pub fn start_timer(hz: u32) {
    let rate = TIMER_TICKS_PER_SEC.load(Ordering::Relaxed);
    if rate == 0 || hz == 0 {
        return;
    }
    let initial = (rate / hz).max(1);
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, TIMER_PERIODIC | u32::from(SCHED_VECTOR));
    write(REG_TIMER_INITIAL, initial);
}

/// BSP bring-up: map, enable, and calibrate the timer. Requires the
/// PIT tick to be live.
///
/// # Safety
///
/// Must run once on the BSP after [`crate::arch::x86_64::interrupts::init`].
pub unsafe fn init_bsp() {
    // SAFETY: forwarded contract.
    unsafe { map_and_enable() };
    write(REG_TPR, 0);
    write(REG_SVR, SVR_ENABLE | SPURIOUS_VECTOR);
    calibrate();
}

/// AP bring-up: map and enable; the BSP's calibration is reused.
///
/// # Safety
///
/// Must run on the AP itself before it enters the scheduler.
pub unsafe fn init_ap() {
    // SAFETY: forwarded contract.
    unsafe { map_and_enable() };
    write(REG_TPR, 0);
    write(REG_SVR, SVR_ENABLE | SPURIOUS_VECTOR);
}
