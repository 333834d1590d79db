//! Host-synchronized clock.
//!
//! A write to the latch register snapshots the host's microsecond counter;
//! the two read registers then return the low and high halves, giving the
//! guest an atomic 64-bit read.
//!
//! Registers:
//!   0x00 TIME_US_LO  (ro) Latched microseconds, low 32 bits
//!   0x04 TIME_US_HI  (ro) Latched microseconds, high 32 bits
//!   0x08 TIME_LATCH  (wo) Write any value to latch the current time

use crate::bus::{Device, Width};
use std::time::Instant;

pub struct HostClock {
    start: Instant,
    latched_us: u64,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            latched_us: 0,
        }
    }

    pub fn current_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostClock {
    fn read(&mut self, offset: u32, _width: Width) -> u32 {
        match offset {
            0x00 => self.latched_us as u32,
            0x04 => (self.latched_us >> 32) as u32,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, _width: Width, _val: u32) {
        if offset == 0x08 {
            self.latched_us = self.current_us();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_then_read_halves() {
        let mut clock = HostClock::new();
        assert_eq!(clock.read(0x00, Width::Word), 0);

        clock.write(0x08, Width::Word, 1);
        let lo = clock.read(0x00, Width::Word) as u64;
        let hi = clock.read(0x04, Width::Word) as u64;
        let latched = (hi << 32) | lo;
        assert!(latched <= clock.current_us());

        // reads do not re-latch
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(clock.read(0x00, Width::Word) as u64, lo);
    }
}
