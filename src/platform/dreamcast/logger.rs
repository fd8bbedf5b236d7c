//! debug output over the SCIF serial port (the one on the back of the console)

use crate::logging::DebugSink;
use volatile::Volatile;

/// transmit FIFO data register
const SCFTDR2: usize = 0xffe8_000c;

/// serial status register
const SCFSR2: usize = 0xffe8_0010;

/// transmit FIFO has room
const SCFSR2_TDFE: u16 = 0x20;

/// transmission ended
const SCFSR2_TEND: u16 = 0x40;

/// Write a single byte to the serial port
///
/// # Safety
///
/// This method is unsafe because it does MMIO accesses without synchronisation
pub unsafe fn serial_putb(b: u8) {
    let mut status = Volatile::new(&mut *(SCFSR2 as *mut u16));

    // wait for room in the fifo
    while status.read() & SCFSR2_TDFE == 0 {}

    Volatile::new(&mut *(SCFTDR2 as *mut u8)).write(b);
    status.update(|s| *s &= !(SCFSR2_TDFE | SCFSR2_TEND));
}

/// Write a string to the serial port, turning newlines into CRLF
///
/// # Safety
///
/// This method is unsafe because it does MMIO accesses without synchronisation
pub unsafe fn serial_puts(s: &str) {
    for b in s.bytes() {
        if b == b'\n' {
            serial_putb(b'\r');
        }
        serial_putb(b);
    }
}

/// the SCIF as a log sink
///
/// there's no locking, interleaved lines from an exception handler are preferable to a deadlock
pub struct Serial;

impl DebugSink for Serial {
    fn puts(&self, s: &str) {
        unsafe { serial_puts(s) }
    }
}

pub static SERIAL: Serial = Serial;
