//! I2S audio output.
//!
//! A 2048-entry ring of stereo 16-bit samples. The guest pushes samples
//! through the data register; the host pulls them through an [`AudioOut`]
//! handle, which may live on the audio callback thread, so the ring sits
//! behind a mutex.
//!
//! Registers:
//!   0x00 CTRL    Control
//!   0x04 STATUS  Status (ro)
//!   0x08 DATA    Sample write (wo)
//!   0x0C CLKDIV  Clock divider (cycles per sample)
//!   0x10 BUFCNT  Buffered sample count (ro)

use crate::bus::{Device, Interrupt, Width};
use std::sync::{Arc, Mutex};

pub const I2S_IRQ: u32 = 25;

/// Ring capacity in stereo frames.
pub const BUFFER_SIZE: usize = 2048;
pub const HALF_BUFFER: usize = BUFFER_SIZE / 2;

const DEFAULT_SAMPLE_RATE: u32 = 22_050;
const CPU_CLOCK: u32 = 144_000_000;

pub const CTRL_EN: u32 = 1 << 0;
pub const CTRL_TXIE: u32 = 1 << 1;
pub const CTRL_DMAE: u32 = 1 << 2;
pub const CTRL_STEREO: u32 = 1 << 3;
pub const CTRL_FMT16: u32 = 1 << 4;

pub const STATUS_TXE: u32 = 1 << 0;
pub const STATUS_TXNF: u32 = 1 << 1;
pub const STATUS_TXHF: u32 = 1 << 2;
pub const STATUS_BSY: u32 = 1 << 3;

struct Ring {
    buf: Vec<i16>,
    write_pos: usize,
    read_pos: usize,
    count: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            buf: vec![0; BUFFER_SIZE * 2],
            write_pos: 0,
            read_pos: 0,
            count: 0,
        }
    }

    fn clear(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
        self.count = 0;
    }

    fn push(&mut self, left: i16, right: i16) {
        if self.count >= BUFFER_SIZE {
            return;
        }
        self.buf[self.write_pos] = left;
        self.buf[self.write_pos + 1] = right;
        self.write_pos = (self.write_pos + 2) % self.buf.len();
        self.count += 1;
    }

    fn skip_one(&mut self) {
        if self.count > 0 {
            self.read_pos = (self.read_pos + 2) % self.buf.len();
            self.count -= 1;
        }
    }
}

/// Host-side pull handle; safe to use from the audio thread.
#[derive(Clone)]
pub struct AudioOut {
    ring: Arc<Mutex<Ring>>,
}

impl AudioOut {
    /// Read up to `out.len() / 2` stereo frames as interleaved L/R samples.
    /// Returns the number of frames written.
    pub fn read_samples(&self, out: &mut [i16]) -> usize {
        let mut ring = self.ring.lock().unwrap();
        let mut frames = 0;
        while (frames + 1) * 2 <= out.len() && ring.count > 0 {
            out[frames * 2] = ring.buf[ring.read_pos];
            out[frames * 2 + 1] = ring.buf[ring.read_pos + 1];
            ring.read_pos = (ring.read_pos + 2) % ring.buf.len();
            ring.count -= 1;
            frames += 1;
        }
        frames
    }

    pub fn buffered_frames(&self) -> usize {
        self.ring.lock().unwrap().count
    }
}

pub struct I2s {
    ctrl: u32,
    clkdiv: u32,
    ring: Arc<Mutex<Ring>>,
    last_sample_cycle: u64,
}

impl I2s {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            clkdiv: CPU_CLOCK / DEFAULT_SAMPLE_RATE,
            ring: Arc::new(Mutex::new(Ring::new())),
            last_sample_cycle: 0,
        }
    }

    pub fn audio_out(&self) -> AudioOut {
        AudioOut {
            ring: self.ring.clone(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        if self.clkdiv > 0 {
            CPU_CLOCK / self.clkdiv
        } else {
            DEFAULT_SAMPLE_RATE
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ctrl & CTRL_EN != 0
    }

    /// DMA request line: asserted while enabled, DMA-fed and below half full.
    pub fn dma_request(&self) -> bool {
        self.ctrl & CTRL_EN != 0
            && self.ctrl & CTRL_DMAE != 0
            && self.ring.lock().unwrap().count < HALF_BUFFER
    }

    fn status(&self) -> u32 {
        let count = self.ring.lock().unwrap().count;
        let mut status = 0;
        if count == 0 {
            status |= STATUS_TXE;
        }
        if count < BUFFER_SIZE {
            status |= STATUS_TXNF;
        }
        if count >= HALF_BUFFER {
            status |= STATUS_TXHF;
        }
        if self.ctrl & CTRL_EN != 0 && count > 0 {
            status |= STATUS_BSY;
        }
        status
    }

    fn write_sample(&mut self, val: u32) {
        if self.ctrl & CTRL_EN == 0 {
            return;
        }
        let mut ring = self.ring.lock().unwrap();
        if self.ctrl & CTRL_STEREO != 0 {
            // stereo: val = (right << 16) | left
            ring.push(val as i16, (val >> 16) as i16);
        } else {
            // mono: duplicate to both channels
            let sample = val as i16;
            ring.push(sample, sample);
        }
    }
}

impl Default for I2s {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for I2s {
    fn read(&mut self, offset: u32, _width: Width) -> u32 {
        match offset {
            0x00 => self.ctrl,
            0x04 => self.status(),
            0x08 => 0, // write-only
            0x0C => self.clkdiv,
            0x10 => self.ring.lock().unwrap().count as u32,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, _width: Width, val: u32) {
        match offset {
            0x00 => {
                self.ctrl = val;
                if self.ctrl & CTRL_EN == 0 {
                    self.ring.lock().unwrap().clear();
                }
            }
            0x08 => self.write_sample(val),
            0x0C => self.clkdiv = val,
            _ => {}
        }
    }

    fn tick(&mut self, cycles: u64) -> Option<Interrupt> {
        if self.ctrl & CTRL_EN == 0 {
            return None;
        }

        let cycles_per_sample = self.clkdiv.max(1) as u64;
        if cycles.wrapping_sub(self.last_sample_cycle) >= cycles_per_sample {
            self.last_sample_cycle = cycles;

            let count = {
                let mut ring = self.ring.lock().unwrap();
                ring.skip_one();
                ring.count
            };

            if self.ctrl & CTRL_TXIE != 0 && count < HALF_BUFFER {
                return Some(Interrupt { cause: I2S_IRQ });
            }
        }

        None
    }
}
