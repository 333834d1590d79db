//! System timer.
//!
//! A 64-bit millisecond counter driven by host wall-clock time so guest
//! uptime tracks real time regardless of emulation speed, plus a 64-bit
//! compare register.
//!
//! Registers:
//!   0x00 MTIME_LO     Current time low (ms since device creation)
//!   0x04 MTIME_HI     Current time high
//!   0x08 MTIMECMP_LO  Compare low (write re-arms the interrupt)
//!   0x0C MTIMECMP_HI  Compare high

use crate::bus::{Device, Interrupt, Width};
use crate::IntCause;
use std::time::Instant;

pub struct SysTimer {
    start: Instant,
    mtimecmp: u64,
    irq_pending: bool,
}

impl SysTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            mtimecmp: 0,
            irq_pending: false,
        }
    }

    pub fn mtime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn mtimecmp(&self) -> u64 {
        self.mtimecmp
    }
}

impl Default for SysTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SysTimer {
    fn read(&mut self, offset: u32, _width: Width) -> u32 {
        let mtime = self.mtime_ms();
        match offset {
            0x00 => mtime as u32,
            0x04 => (mtime >> 32) as u32,
            0x08 => self.mtimecmp as u32,
            0x0C => (self.mtimecmp >> 32) as u32,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, _width: Width, val: u32) {
        match offset {
            // writing MTIME_LO rebases the counter to zero
            0x00 => self.start = Instant::now(),
            0x04 => {}
            0x08 => {
                self.mtimecmp = (self.mtimecmp & 0xFFFF_FFFF_0000_0000) | val as u64;
                self.irq_pending = false;
            }
            0x0C => {
                self.mtimecmp = (self.mtimecmp & 0xFFFF_FFFF) | ((val as u64) << 32);
            }
            _ => {}
        }
    }

    fn tick(&mut self, _cycles: u64) -> Option<Interrupt> {
        if self.mtimecmp != 0 && self.mtime_ms() >= self.mtimecmp && !self.irq_pending {
            self.irq_pending = true;
            return Some(Interrupt {
                cause: IntCause::MTimer as u32,
            });
        }
        None
    }
}
