//! TED sound generator: two square-wave channels, a noise source on
//! channel 2, and DAC mode.
//!
//! The generator is ticked once every four single-clock cycles (221 kHz on
//! PAL). Registers:
//!
//! - FF0E + FF12 bits 0-1: channel 1 frequency (10 bits)
//! - FF0F + FF10 bits 0-1: channel 2 frequency (10 bits)
//! - FF11: bits 0-3 volume, bit 4 channel 1 on, bit 5 channel 2 square on,
//!   bit 6 channel 2 noise on, bit 7 DAC mode

use crate::TedError;
use emu_core::apu::{AudioChip, TimingMode};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Ticks a channel may keep underflowing on every tick before its output
/// settles at 1.
pub const DECAY_TICKS: u32 = 0x2E000;

const VOLUME_TABLE: [u8; 16] = [0, 6, 16, 26, 36, 46, 56, 66, 75, 75, 75, 75, 75, 75, 75, 75];

/// Number of active outputs for `flags | ch1 << 2 | ch2 << 1 | noise`.
const MIX_TABLE: [u8; 128] = build_mix_table();

/// Soft clipping of the sum of the two most recent output levels. The
/// parabola approximates the measured chip response; it is not sampled data.
const DISTORTION_TABLE: [i16; 301] = build_distortion_table();

const fn build_mix_table() -> [u8; 128] {
    let mut t = [0u8; 128];
    let mut i = 0;
    while i < 128 {
        let ch1 = i & 0x08 != 0 && i & 0x04 != 0;
        let ch2 = if i & 0x10 != 0 {
            i & 0x02 != 0
        } else {
            i & 0x20 != 0 && i & 0x01 != 0
        };
        t[i] = ch1 as u8 + ch2 as u8;
        i += 1;
    }
    t
}

const fn build_distortion_table() -> [i16; 301] {
    let mut t = [0i16; 301];
    let mut x = 0;
    while x <= 300 {
        t[x] = (x as i64 * (600 - x as i64) * 32767 / 90000) as i16;
        x += 1;
    }
    t
}

/// Convert a 10-bit frequency register value to the counter reload value
/// (1..=1024).
pub fn reload_value(freq: u16) -> u16 {
    ((((freq & 0x3FF) + 1) ^ 0x3FF) & 0x3FF) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToneChannel {
    pub counter: u16,
    pub reload: u16,
    pub decay: u32,
    pub state: u8,
    /// The counter also underflowed on the previous tick.
    pub overflow: bool,
}

impl Default for ToneChannel {
    fn default() -> Self {
        Self {
            counter: 0x3FF,
            reload: 0x3FF,
            decay: DECAY_TICKS,
            state: 1,
            overflow: false,
        }
    }
}

impl ToneChannel {
    /// Count down once; returns true when the output toggled.
    fn step(&mut self) -> bool {
        if self.counter > 1 {
            self.counter -= 1;
            self.overflow = false;
            return false;
        }
        self.counter = self.reload;
        let toggled = if self.overflow {
            if self.decay > 0 {
                self.decay -= 1;
            } else {
                self.state = 1;
            }
            false
        } else {
            self.state ^= 1;
            self.decay = DECAY_TICKS;
            true
        };
        self.overflow = true;
        toggled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TedSound {
    pub channels: [ToneChannel; 2],
    /// 8-bit LFSR clocked by channel 2.
    pub noise: u8,
    /// FF11 bits 4-7 shifted right by one, ready to index the mix table.
    pub flags: u8,
    pub volume: u8,
    pub output: u8,
    pub prev_output: u8,
    /// Cycles until the next tick.
    pub divider: u8,
    /// Copies of FF0E-FF12.
    regs: [u8; 5],
    timing: TimingMode,
}

impl Default for TedSound {
    fn default() -> Self {
        Self::new(TimingMode::Pal)
    }
}

impl TedSound {
    pub fn new(timing: TimingMode) -> Self {
        Self {
            channels: [ToneChannel::default(); 2],
            noise: 0xFF,
            flags: 0,
            volume: 0,
            output: 0,
            prev_output: 0,
            divider: 0,
            regs: [0; 5],
            timing,
        }
    }

    pub fn set_timing(&mut self, timing: TimingMode) {
        self.timing = timing;
    }

    /// Check state loaded from a snapshot: the mix and distortion tables
    /// are indexed with these fields.
    pub(crate) fn validate(&self) -> Result<(), TedError> {
        let max_output = 2 * VOLUME_TABLE[15];
        if self.flags & !0x78 != 0 {
            return Err(TedError::InvalidArgument(format!(
                "invalid sound flags 0x{:02X}",
                self.flags
            )));
        }
        if !VOLUME_TABLE.contains(&self.volume) {
            return Err(TedError::InvalidArgument(format!(
                "invalid sound volume {}",
                self.volume
            )));
        }
        if self.output > max_output || self.prev_output > max_output {
            return Err(TedError::InvalidArgument(format!(
                "sound output {}/{} out of range",
                self.output, self.prev_output
            )));
        }
        Ok(())
    }

    /// Called once per single-clock cycle; returns a sample every fourth
    /// call.
    pub fn cycle(&mut self) -> Option<i16> {
        let sample = (self.divider == 0).then(|| {
            self.divider = 4;
            self.clock()
        });
        self.divider -= 1;
        sample
    }

    fn update_output(&mut self) {
        let ch1 = self.channels[0].state & 1;
        let ch2 = self.channels[1].state & 1;
        let index = self.flags | (ch1 << 2) | (ch2 << 1) | (self.noise & 1);
        self.output = MIX_TABLE[index as usize] * self.volume;
    }

    fn frequency(&self, channel: usize) -> u16 {
        match channel {
            0 => self.regs[0] as u16 | ((self.regs[4] as u16 & 3) << 8),
            _ => self.regs[1] as u16 | ((self.regs[2] as u16 & 3) << 8),
        }
    }
}

impl AudioChip for TedSound {
    fn write_register(&mut self, addr: u16, val: u8) {
        let n = (addr & 0x1F) as usize;
        if !(0x0E..=0x12).contains(&n) {
            return;
        }
        self.regs[n - 0x0E] = val;
        log(LogCategory::Sound, LogLevel::Trace, || {
            format!("FF{:02X} <- 0x{:02X}", n, val)
        });
        match n {
            0x0E | 0x12 => self.channels[0].reload = reload_value(self.frequency(0)),
            0x0F | 0x10 => self.channels[1].reload = reload_value(self.frequency(1)),
            _ => {
                self.flags = (val & 0xF0) >> 1;
                self.volume = VOLUME_TABLE[(val & 0x0F) as usize];
                self.update_output();
            }
        }
    }

    fn read_register(&self, addr: u16) -> u8 {
        match (addr & 0x1F) as usize {
            n @ 0x0E..=0x12 => self.regs[n - 0x0E],
            _ => 0,
        }
    }

    fn clock(&mut self) -> i16 {
        if self.flags & 0x40 != 0 {
            for ch in &mut self.channels {
                ch.counter = ch.reload;
                ch.state = 1;
                ch.overflow = false;
            }
            self.noise = 0xFF;
        } else {
            self.channels[0].step();
            if self.channels[1].step() {
                let n = self.noise;
                let feedback = ((n >> 7) ^ (n >> 5) ^ (n >> 4) ^ (n >> 1)) & 1;
                self.noise = (n << 1) | feedback;
            }
        }
        self.update_output();
        let sample = DISTORTION_TABLE[self.output as usize + self.prev_output as usize];
        self.prev_output = self.output;
        sample
    }

    fn timing(&self) -> TimingMode {
        self.timing
    }

    fn reset(&mut self) {
        *self = Self::new(self.timing);
    }

    fn sample_rate(&self) -> f64 {
        self.timing.cpu_clock_hz() / 4.0
    }
}
