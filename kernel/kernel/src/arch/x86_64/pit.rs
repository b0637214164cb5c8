//! 8254 PIT: channel 0 periodic tick source.

use super::Port;

/// PIT oscillator frequency in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

const CHANNEL0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;

/// Programs channel 0 as a rate generator at `hz` interrupts per
/// second (IRQ 0).
///
/// # Safety
///
/// Must run with interrupts disabled during early init; reprogramming
/// the PIT mid-flight changes the global tick rate.
pub unsafe fn init(hz: u32) {
    let divisor = (PIT_FREQUENCY / hz) as u16;
    let cmd = Port::<u8>::new(PIT_CMD);
    let data = Port::<u8>::new(CHANNEL0_DATA);
    // SAFETY: channel 0, lobyte/hibyte, mode 3 (square wave), binary.
    unsafe {
        cmd.write(0x36);
        data.write(divisor as u8);
        data.write((divisor >> 8) as u8);
    }
}
