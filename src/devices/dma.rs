//! DMA controller with 8 channels.
//!
//! A rising edge on CCR.EN arms a channel; each tick moves one element on
//! one channel (lowest armed index first, so channels share the bus
//! fairly). Circular channels reload on completion, one-shot channels
//! clear their enable bit. The channel reaches guest memory and
//! peripherals through a weak bus handle installed at machine assembly.
//!
//! Registers:
//!   0x00 ISR   Interrupt status (ro, 4 flag bits per channel)
//!   0x04 IFCR  Interrupt flag clear (wo, write 1 to clear)
//!   0x08 + n*0x14: CCR, CNDTR, CPAR, CMAR per channel

use crate::bus::{Bus, Device, Interrupt, Width};
use std::rc::Weak;

pub const NUM_CHANNELS: usize = 8;

/// IRQ line of channel 0; channel n maps to `DMA_CH1_IRQ + n`.
pub const DMA_CH1_IRQ: u32 = 16;

pub const CCR_EN: u32 = 1 << 0;
pub const CCR_TCIE: u32 = 1 << 1;
pub const CCR_HTIE: u32 = 1 << 2;
pub const CCR_TEIE: u32 = 1 << 3;
pub const CCR_DIR: u32 = 1 << 4;
pub const CCR_CIRC: u32 = 1 << 5;
pub const CCR_PINC: u32 = 1 << 6;
pub const CCR_MINC: u32 = 1 << 7;
pub const CCR_PSIZE_SHIFT: u32 = 8;
pub const CCR_MSIZE_SHIFT: u32 = 10;
pub const CCR_MEM2MEM: u32 = 1 << 14;

// per-channel ISR flags, 4 bits each
pub const ISR_GIF: u32 = 1 << 0;
pub const ISR_TCIF: u32 = 1 << 1;

#[derive(Default, Clone, Copy)]
struct Channel {
    ccr: u32,
    cndtr: u32,
    cpar: u32,
    cmar: u32,

    remaining: u32,
    current_par: u32,
    current_mar: u32,
    reload_count: u32,
}

pub struct Dma {
    channels: [Channel; NUM_CHANNELS],
    isr: u32,
    bus: Weak<Bus>,
}

impl Dma {
    pub fn new() -> Self {
        Self {
            channels: [Channel::default(); NUM_CHANNELS],
            isr: 0,
            bus: Weak::new(),
        }
    }

    pub fn connect_bus(&mut self, bus: Weak<Bus>) {
        self.bus = bus;
    }

    pub fn isr(&self) -> u32 {
        self.isr
    }

    fn start_channel(&mut self, ch: usize) {
        let chan = &mut self.channels[ch];
        chan.remaining = chan.cndtr;
        chan.reload_count = chan.cndtr;
        chan.current_par = chan.cpar;
        chan.current_mar = chan.cmar;
    }

    fn size_to_width(bits: u32) -> Width {
        match bits & 0x3 {
            0 => Width::Byte,
            1 => Width::Half,
            _ => Width::Word,
        }
    }

    fn width_step(width: Width) -> u32 {
        match width {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    fn do_transfer(&mut self, ch: usize, bus: &Bus) {
        let chan = &mut self.channels[ch];

        let pw = Self::size_to_width(chan.ccr >> CCR_PSIZE_SHIFT);
        let mw = Self::size_to_width(chan.ccr >> CCR_MSIZE_SHIFT);

        // In memory-to-memory mode the "peripheral" address is the source
        // memory; CCR.DIR flips source and destination otherwise.
        let (src_addr, dst_addr, src_width, dst_width, src_inc, dst_inc) =
            if chan.ccr & CCR_MEM2MEM != 0 || chan.ccr & CCR_DIR == 0 {
                (
                    chan.current_par,
                    chan.current_mar,
                    pw,
                    mw,
                    chan.ccr & CCR_PINC != 0,
                    chan.ccr & CCR_MINC != 0,
                )
            } else {
                (
                    chan.current_mar,
                    chan.current_par,
                    mw,
                    pw,
                    chan.ccr & CCR_MINC != 0,
                    chan.ccr & CCR_PINC != 0,
                )
            };

        let data = bus.read(src_addr, src_width);
        bus.write(dst_addr, dst_width, data);

        let src_step = Self::width_step(src_width);
        let dst_step = Self::width_step(dst_width);
        if chan.ccr & CCR_MEM2MEM != 0 || chan.ccr & CCR_DIR == 0 {
            if src_inc {
                chan.current_par = chan.current_par.wrapping_add(src_step);
            }
            if dst_inc {
                chan.current_mar = chan.current_mar.wrapping_add(dst_step);
            }
        } else {
            if src_inc {
                chan.current_mar = chan.current_mar.wrapping_add(src_step);
            }
            if dst_inc {
                chan.current_par = chan.current_par.wrapping_add(dst_step);
            }
        }

        chan.remaining -= 1;
    }
}

impl Default for Dma {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Dma {
    fn read(&mut self, offset: u32, _width: Width) -> u32 {
        let offset = offset & 0xFFF;

        if offset == 0x00 {
            return self.isr;
        }
        if offset == 0x04 {
            return 0; // IFCR is write-only
        }
        if offset >= 0x08 {
            let rel = offset - 0x08;
            let ch = (rel / 0x14) as usize;
            if ch < NUM_CHANNELS {
                let chan = &self.channels[ch];
                return match rel % 0x14 {
                    0x00 => chan.ccr,
                    // an armed channel reports its live countdown
                    0x04 => {
                        if chan.ccr & CCR_EN != 0 {
                            chan.remaining
                        } else {
                            chan.cndtr
                        }
                    }
                    0x08 => chan.cpar,
                    0x0C => chan.cmar,
                    _ => 0,
                };
            }
        }

        0
    }

    fn write(&mut self, offset: u32, _width: Width, val: u32) {
        let offset = offset & 0xFFF;

        if offset == 0x00 {
            return; // ISR is read-only
        }
        if offset == 0x04 {
            self.isr &= !val;
            return;
        }
        if offset >= 0x08 {
            let rel = offset - 0x08;
            let ch = (rel / 0x14) as usize;
            if ch < NUM_CHANNELS {
                match rel % 0x14 {
                    0x00 => {
                        let was_enabled = self.channels[ch].ccr & CCR_EN != 0;
                        self.channels[ch].ccr = val;
                        if !was_enabled && val & CCR_EN != 0 {
                            self.start_channel(ch);
                        }
                    }
                    0x04 => {
                        self.channels[ch].cndtr = val & 0xFFFF;
                        self.channels[ch].reload_count = self.channels[ch].cndtr;
                    }
                    0x08 => self.channels[ch].cpar = val,
                    0x0C => self.channels[ch].cmar = val,
                    _ => {}
                }
            }
        }
    }

    fn tick(&mut self, _cycles: u64) -> Option<Interrupt> {
        let bus = self.bus.upgrade()?;

        for ch in 0..NUM_CHANNELS {
            if self.channels[ch].ccr & CCR_EN == 0 || self.channels[ch].remaining == 0 {
                continue;
            }

            self.do_transfer(ch, &bus);

            if self.channels[ch].remaining == 0 {
                self.isr |= (ISR_TCIF | ISR_GIF) << (ch * 4);

                let chan = &mut self.channels[ch];
                if chan.ccr & CCR_CIRC != 0 {
                    chan.remaining = chan.reload_count;
                    chan.current_par = chan.cpar;
                    chan.current_mar = chan.cmar;
                } else {
                    chan.ccr &= !CCR_EN;
                }

                if chan.ccr & CCR_TCIE != 0 {
                    return Some(Interrupt {
                        cause: DMA_CH1_IRQ + ch as u32,
                    });
                }
            }

            // one channel per tick
            break;
        }

        None
    }
}
