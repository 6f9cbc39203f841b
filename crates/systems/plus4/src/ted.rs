//! TED7360 chip state and the cycle-stepping engine.
//!
//! [`TedChip`] holds everything the chip owns: memory, the register file,
//! the video pipeline, timers and the sound generator. [`Ted7360`] attaches
//! a CPU core and registered phase callbacks and advances the whole machine
//! one single-clock cycle (two half-cycles) at a time.

use crate::cpu::TedCpu;
use crate::events::DelayedEvents;
use crate::memory::{AccessKind, MapSelect, Memory, SegmentKind};
use crate::render::{Renderer, ShiftRegister, OUTPUT_BUFFER_SIZE};
use crate::sound::TedSound;
use crate::TedError;
use emu_core::apu::{AudioChip, TimingMode};
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// FF00-FF1F after power-on or a cold reset.
const REGISTER_INIT: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1B, 0x08, 0xFF, 0x04, 0xA0, 0x00, 0xFF, 0xFF, 0x00, 0x00,
    0x7C, 0x00, 0xC4, 0x01, 0x07, 0x80, 0x80, 0x80, 0x80, 0x80, 0xFF, 0xE8, 0xFE, 0xE0, 0xC8, 0x80,
];

pub const MAX_CALLBACKS: usize = 16;

/// Callback phase bits for [`Ted7360::set_callback`].
pub const PHASE_EVEN: u8 = 0x01;
pub const PHASE_ODD: u8 = 0x02;

/// Receiver of everything the chip produces.
pub trait TedOutput {
    /// A batch of complete video records (see [`crate::render`]).
    fn video_output(&mut self, records: &[u8]);

    fn ntsc_mode_changed(&mut self, _ntsc: bool) {}

    /// One sound sample, produced every fourth cycle.
    fn play_sample(&mut self, _sample: i16) {}
}

/// Discards all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl TedOutput for NullOutput {
    fn video_output(&mut self, _records: &[u8]) {}
}

/// Processor port, external ports and the bus latch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoState {
    pub port_dir: u8,
    pub port_out: u8,
    pub user_port: u8,
    /// Hannes/CSORY memory expansion register.
    pub hannes: u8,
    /// Keyboard row select latched from FD3x (bits 0-7) and FF08 (bits 8-10).
    pub kbd_select: u16,
    pub keyboard: [u8; 16],
    pub tape_read: bool,
    pub tape_button: bool,
    pub tape_motor: bool,
    pub tape_write: bool,
    /// Last value driven on the data bus; open-bus reads return it.
    pub data_bus: u8,
    /// Current level of the IRQ output.
    pub irq: bool,
}

impl Default for IoState {
    fn default() -> Self {
        Self {
            port_dir: 0x0F,
            port_out: 0xC8,
            user_port: 0xFF,
            hannes: 0xFF,
            kbd_select: 0xFFFF,
            keyboard: [0xFF; 16],
            tape_read: false,
            tape_button: false,
            tape_motor: false,
            tape_write: false,
            data_bus: 0xFF,
            irq: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timers {
    pub t1_run: bool,
    pub t2_run: bool,
    pub t3_run: bool,
    pub t1: u16,
    pub t1_reload: u16,
    pub t2: u16,
    pub t3: u16,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            t1_run: true,
            t2_run: true,
            t3_run: true,
            t1: 0,
            t1_reload: 0,
            t2: 0,
            t3: 0,
        }
    }
}

/// Raster, DMA and rendering state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoState {
    /// Horizontal position in half-cycles (0..=113).
    pub column: u8,
    pub line: u16,
    /// Line number as seen by the register file and the vertical triggers.
    pub line_latch: u16,
    /// `line_latch` delayed by half a line.
    pub line_delayed: u16,
    pub sub_line: u8,
    pub prev_sub_line: u8,
    pub sub_line_counting: bool,
    pub char_pos: u16,
    pub char_pos_latch: u16,
    pub char_pos_reload: u16,
    pub char_pos_counting: bool,
    pub cursor: u16,
    /// Index into the 64-entry fetch buffers; 40 means idle.
    pub fetch_column: u8,
    pub dma_pos: u16,
    pub dma_pos_reload: u16,
    pub dma_pos_counting: bool,
    pub dma_base: u16,
    pub dma_enabled: bool,
    pub dma_active: bool,
    /// Bit 0: attribute DMA, bit 1: character DMA, bit 7: DMA allowed.
    pub dma_flags: u8,
    pub bitmap_base: u16,
    pub charset_base: u16,
    pub char_mask: u8,
    /// Bit 0: bitmap fetch off for the rest of the line, bit 1: below the
    /// display window.
    pub fetch_disable: u8,
    /// Bit 0: single clock requested, bit 1: forced by FF13, bit 7: DRAM
    /// refresh.
    pub single_clock: u8,
    pub ext_fetch: bool,
    pub refresh_addr: u8,
    pub render_window: bool,
    pub display_window: bool,
    pub display_active: bool,
    pub frozen: bool,
    pub flash: u8,
    pub vsync: u8,
    pub out_flags: u8,
    /// FF07 bits 4 and 7 and FF06 bits 5-6, packed.
    pub mode: u8,
    pub mode_renderer: Renderer,
    pub renderer: Renderer,
    /// Background and border colors latched from FF15-FF19.
    pub colors: [u8; 5],
    pub hscroll: u8,
    pub vscroll: u8,
    pub raster_compare: u16,
    pub raster_irq_latch: bool,
    pub cpu_running: bool,
    pub cpu_halted: bool,
    pub shifter_enabled: bool,
    pub shifter: ShiftRegister,
    pub fetched: ShiftRegister,
    pub queued: ShiftRegister,
    pub attr_buf: Vec<u8>,
    pub attr_fetch: Vec<u8>,
    pub char_buf: Vec<u8>,
    pub even_events: DelayedEvents,
    pub odd_events: DelayedEvents,
    pub out_buf: Vec<u8>,
    pub out_pos: usize,
    pub out_prev_pos: usize,
    /// Input clock ticks per single-clock cycle (20 PAL, 16 NTSC).
    pub cycle_len: i32,
    /// Overrun of the previous `run` call, always <= 0.
    pub cycle_carry: i32,
}

impl Default for VideoState {
    fn default() -> Self {
        Self {
            column: 100,
            line: 224,
            line_latch: 224,
            line_delayed: 223,
            sub_line: 0,
            prev_sub_line: 0,
            sub_line_counting: false,
            char_pos: 0,
            char_pos_latch: 0,
            char_pos_reload: 0,
            char_pos_counting: false,
            cursor: 0x3FF,
            fetch_column: 0,
            dma_pos: 0x3FF,
            dma_pos_reload: 0x3FF,
            dma_pos_counting: false,
            dma_base: 0,
            dma_enabled: false,
            dma_active: false,
            dma_flags: 0,
            bitmap_base: 0,
            charset_base: 0,
            char_mask: 0x7F,
            fetch_disable: 0x03,
            single_clock: 0,
            ext_fetch: true,
            refresh_addr: 0,
            render_window: false,
            display_window: false,
            display_active: false,
            frozen: false,
            flash: 0,
            vsync: 0,
            out_flags: 0x30,
            mode: 0,
            mode_renderer: Renderer::CharStd,
            renderer: Renderer::Border,
            colors: [0x80; 5],
            hscroll: 0,
            vscroll: 3,
            raster_compare: 0,
            raster_irq_latch: false,
            cpu_running: true,
            cpu_halted: false,
            shifter_enabled: false,
            shifter: ShiftRegister::default(),
            fetched: ShiftRegister::default(),
            queued: ShiftRegister::default(),
            attr_buf: vec![0; 64],
            attr_fetch: vec![0; 64],
            char_buf: vec![0; 64],
            even_events: DelayedEvents::default(),
            odd_events: DelayedEvents::default(),
            out_buf: vec![0; OUTPUT_BUFFER_SIZE],
            out_pos: 0,
            out_prev_pos: 0,
            cycle_len: 20,
            cycle_carry: 0,
        }
    }
}

/// The chip without its CPU.
pub struct TedChip {
    pub memory: Memory,
    pub regs: [u8; 32],
    pub io: IoState,
    pub video: VideoState,
    pub timers: Timers,
    pub sound: TedSound,
    pub(crate) cpu_clock_multiplier: i32,
    pub(crate) output: Box<dyn TedOutput>,
}

impl Default for TedChip {
    fn default() -> Self {
        Self::new()
    }
}

impl TedChip {
    /// A powered-on chip with no RAM or ROM attached.
    pub fn new() -> Self {
        let mut chip = Self {
            memory: Memory::new(),
            regs: REGISTER_INIT,
            io: IoState::default(),
            video: VideoState::default(),
            timers: Timers::default(),
            sound: TedSound::new(TimingMode::Pal),
            cpu_clock_multiplier: 1,
            output: Box::new(NullOutput),
        };
        chip.init_registers();
        chip
    }

    pub fn set_output(&mut self, output: Box<dyn TedOutput>) {
        self.output = output;
    }

    /// Put every register and internal counter in its reset state. RAM,
    /// ROM, the keyboard matrix and the external port inputs are kept.
    pub(crate) fn init_registers(&mut self) {
        if self.regs[0x07] & 0x40 != 0 {
            self.regs[0x07] = 0x00;
            self.output.ntsc_mode_changed(false);
        }
        self.regs = REGISTER_INIT;
        self.memory.maps = MapSelect::default();
        self.io = IoState {
            user_port: self.io.user_port,
            keyboard: self.io.keyboard,
            tape_read: self.io.tape_read,
            tape_button: self.io.tape_button,
            ..IoState::default()
        };
        self.video = VideoState::default();
        self.timers = Timers::default();
        self.sound = TedSound::new(TimingMode::Pal);
        for n in 0x0E..=0x12 {
            self.sound.write_register(n as u16, self.regs[n]);
        }
        self.update_interrupt_flag();
    }

    /// Resize and refill RAM, then reset the chip registers.
    pub fn configure_ram(&mut self, size_kib: u32, pattern: u64) -> Result<(), TedError> {
        self.memory.configure_ram(size_kib, pattern)?;
        self.init_registers();
        Ok(())
    }

    /// Copy ROM data into `bank` (0..=3) at `offset`, or delete the segment
    /// `offset` falls into when `data` is `None`.
    pub fn load_rom(&mut self, bank: u8, offset: usize, data: Option<&[u8]>) {
        self.memory.load_rom(bank, offset, data);
    }

    /// The register-level part of a reset: everything except the CPU.
    pub(crate) fn reset_registers(&mut self, cold: bool) {
        if cold {
            self.init_registers();
            self.bump_ram_signatures();
            self.write_bus(0x0508, 0x00);
        }
        self.write_bus(0xFDD0, 0x00);
        self.write_bus(0x0000, 0x00);
        self.write_bus(0x0001, 0x00);
    }

    /// Break any RAM copy of the ROM signature at FFF6-FFFD so the KERNAL
    /// does not mistake an expansion bank for a warm-started machine.
    fn bump_ram_signatures(&mut self) {
        let rom: Vec<u8> = (0xFFF6..=0xFFFD)
            .map(|addr| self.read_memory_cpu(addr, false))
            .collect();
        let fc_present = self.memory.segment_kind(0xFC) != SegmentKind::None;
        for seg in 0xC0u8..0xFF {
            if seg & 0x02 != 0 && !(seg == 0xFE && !fc_present) {
                continue;
            }
            if let Some(buf) = self.memory.segment_mut(seg) {
                if buf[0x3FF6..=0x3FFD] == rom[..] {
                    buf[0x3FF6] = buf[0x3FF6].wrapping_add(1);
                }
            }
        }
    }

    pub fn set_cpu_clock_multiplier(&mut self, multiplier: i32) {
        self.cpu_clock_multiplier = multiplier.clamp(1, 100);
    }

    pub fn cpu_clock_multiplier(&self) -> i32 {
        self.cpu_clock_multiplier
    }

    pub(crate) fn set_cpu_running(&mut self, running: bool) {
        self.video.cpu_running = running;
    }

    pub(crate) fn update_interrupt_flag(&mut self) {
        let irq = self.regs[0x09] & self.regs[0x0A] != 0;
        if irq != self.io.irq {
            log(LogCategory::Interrupts, LogLevel::Trace, || {
                format!(
                    "IRQ {} (FF09=0x{:02X} FF0A=0x{:02X}, line {})",
                    if irq { "asserted" } else { "released" },
                    self.regs[0x09],
                    self.regs[0x0A],
                    self.video.line
                )
            });
        }
        self.io.irq = irq;
    }

    /// Raise the raster interrupt once per match of the line counter.
    pub(crate) fn check_raster_interrupt(&mut self) {
        if self.video.line == self.video.raster_compare {
            if !self.video.raster_irq_latch {
                self.video.raster_irq_latch = true;
                self.regs[0x09] |= 0x02;
                self.update_interrupt_flag();
            }
        } else {
            self.video.raster_irq_latch = false;
        }
    }

    pub fn is_ntsc(&self) -> bool {
        self.regs[0x07] & 0x40 != 0
    }

    /// Horizontal position in pixels / 2 and the current line.
    pub fn video_position(&self) -> (u8, u16) {
        ((self.video.column & 0x7F) << 1, self.video.line_latch & 0x1FF)
    }

    /// True if the raster is at pixel (`x`, `y`) and the pixel most recently
    /// drawn there is not black.
    pub fn check_light_pen(&self, x: i32, y: i32) -> bool {
        if self.video.line_latch as i32 != y {
            return false;
        }
        if !(0..=311).contains(&y) || !(0..=455).contains(&x) {
            return false;
        }
        let column = if x < 452 { ((x + 4) >> 2) as u8 } else { 0 };
        if self.video.column != column {
            return false;
        }
        let pos = self.video.out_prev_pos;
        let buf = &self.video.out_buf;
        let color = if buf[pos] & 0x02 != 0 {
            buf[pos + 1 + (x & 3) as usize]
        } else {
            buf[pos + 1]
        };
        color & 0x0F != 0
    }

    pub fn memory_page(&self, n: u8) -> u8 {
        self.memory.memory_page(n)
    }

    pub fn segment_kind(&self, n: u8) -> SegmentKind {
        self.memory.segment_kind(n)
    }

    pub fn read_memory_raw(&self, addr: u32) -> u8 {
        self.memory.read_raw(addr)
    }

    pub fn write_memory_raw(&mut self, addr: u32, value: u8) {
        self.memory.write_raw(addr, value);
    }

    pub fn user_port(&self) -> u8 {
        self.io.user_port
    }

    pub fn set_user_port(&mut self, value: u8) {
        self.io.user_port = value;
    }

    pub fn set_tape_input(&mut self, state: bool) {
        self.io.tape_read = state;
    }

    pub fn tape_output(&self) -> bool {
        self.io.tape_write
    }

    pub fn set_tape_button_state(&mut self, pressed: bool) {
        self.io.tape_button = pressed;
    }

    pub fn set_tape_motor_state(&mut self, on: bool) {
        self.io.tape_motor = on;
        self.io.port_out = (self.io.port_out & 0xF7) | if on { 0x00 } else { 0x08 };
    }

    pub fn tape_motor_state(&self) -> bool {
        self.io.tape_motor
    }

    /// Load a PRG image (two-byte load address, then data) through the CPU
    /// write path and point the BASIC end-of-program pointers past it.
    pub fn load_prg(&mut self, data: &[u8]) -> Result<(), TedError> {
        if data.len() < 2 {
            return Err(TedError::InvalidArgument(
                "PRG image has no load address".into(),
            ));
        }
        let body = &data[2..];
        if body.len() >= 0x10000 {
            return Err(TedError::InvalidArgument(format!(
                "PRG image too long: {} bytes",
                body.len()
            )));
        }
        let start = u16::from_le_bytes([data[0], data[1]]);
        let mut addr = start;
        for &b in body {
            self.write_bus(addr, b);
            addr = addr.wrapping_add(1);
        }
        let [lo, hi] = addr.to_le_bytes();
        for ptr in [0x2D, 0x2F, 0x31] {
            self.write_bus(ptr, lo);
            self.write_bus(ptr + 1, hi);
        }
        let top = [self.read_memory_cpu(0x37, false), self.read_memory_cpu(0x38, false)];
        self.write_bus(0x33, top[0]);
        self.write_bus(0x34, top[1]);
        self.write_bus(0x9D, lo);
        self.write_bus(0x9E, hi);
        log(LogCategory::Memory, LogLevel::Info, || {
            format!("PRG loaded: 0x{:04X}-0x{:04X}", start, addr)
        });
        Ok(())
    }

    /// The BASIC program between the pointers at 2B and 2D as a PRG image,
    /// read from RAM even where ROM is mapped.
    pub fn save_prg(&self) -> Vec<u8> {
        let word = |a: u16| {
            u16::from_le_bytes([self.read_memory_cpu(a, false), self.read_memory_cpu(a + 1, false)])
        };
        let start = word(0x2B);
        let end = word(0x2D);
        let len = end.saturating_sub(start);
        let mut out = start.to_le_bytes().to_vec();
        out.extend((0..len).map(|i| self.read_memory_cpu(start.wrapping_add(i), true)));
        out
    }

    // Half-cycle building blocks used by `Ted7360::run_cycle`.

    fn begin_cycle(&mut self) {
        self.flush_video_output();
        let v = &mut self.video;
        v.char_pos = 0x3FF;
        if v.char_pos_counting {
            v.char_pos_latch = (v.char_pos_latch + 1) & 0x3FF;
            v.char_pos = v.char_pos_latch;
        }
    }

    /// Even half-cycle column triggers. `now` holds the events dispatched in
    /// this half-cycle; it has already been taken out of `even_events`.
    fn even_column_triggers(&mut self, now: &mut DelayedEvents) {
        let f07 = self.regs[0x07];
        let v = &mut self.video;
        let mut reselect = false;
        match v.column {
            0 => {
                if v.display_window && f07 & 0x08 != 0 {
                    v.display_active = true;
                    reselect = true;
                }
            }
            2 => {
                if v.display_window && f07 & 0x08 == 0 {
                    v.display_active = true;
                    reselect = true;
                }
            }
            38 => {
                if v.vsync != 0 {
                    v.out_flags = (v.out_flags | 0x80) ^ (v.vsync & 0x80);
                    reselect = true;
                }
            }
            72 => {
                if v.dma_pos_counting {
                    v.even_events.stop_dma_count();
                }
                if v.render_window {
                    if v.sub_line == 6 {
                        v.even_events.latch_dma_position();
                    }
                    if v.prev_sub_line == 6 && v.fetch_disable & 0x02 == 0 {
                        v.even_events.latch_char_position();
                    }
                }
            }
            74 => {
                v.even_events.refresh_on();
                v.ext_fetch = false;
                v.dma_flags &= 0x03;
                v.char_pos_counting = false;
            }
            76 => {
                v.fetch_disable |= 0x01;
                now.stop_dma();
                v.even_events.stop_dma();
                v.dma_active = false;
                v.cpu_halted = false;
                v.cpu_running = true;
            }
            78 => {
                if f07 & 0x08 == 0 {
                    v.display_active = false;
                    reselect = true;
                }
                v.shifter_enabled = false;
            }
            80 => {
                if f07 & 0x08 != 0 {
                    v.display_active = false;
                    reselect = true;
                }
            }
            84 => v.even_events.refresh_off(),
            88 => {
                v.out_flags |= 0x20;
                v.renderer = Renderer::Blank;
            }
            90 => {
                if v.vsync == 0 {
                    v.out_flags |= 0x80;
                    v.renderer = Renderer::Blank;
                }
            }
            96 => v.even_events.next_line(),
            98 => {
                let last_line = if v.out_flags & 0x01 != 0 { 261 } else { 311 };
                if v.line_delayed == last_line {
                    v.line = 0x1FF;
                    v.char_pos = 0;
                    v.char_pos_latch = 0;
                    v.char_pos_reload = 0;
                    v.odd_events.char_pos_registers();
                    v.refresh_addr = 0;
                }
                if v.sub_line_counting {
                    v.even_events.next_sub_line();
                }
                if v.vsync == 0 {
                    v.out_flags &= 0x7D;
                    reselect = true;
                }
                if v.out_flags & 0x10 == 0 {
                    v.out_flags |= 0x08;
                }
            }
            100 => {
                v.ext_fetch = true;
                if v.render_window {
                    v.even_events.single_clock_on();
                }
                if v.vsync != 0 {
                    v.out_flags = (v.out_flags & 0x7F) | (v.vsync & 0x80);
                    reselect = true;
                }
            }
            102 => {
                v.dma_flags |= 0x80;
                if v.fetch_column == 40 {
                    v.fetch_column = 0x3C;
                }
                if v.dma_enabled && (v.line_delayed & 7) == v.vscroll as u16 {
                    // attribute fetch on the line before the character row
                    v.even_events.stop_dma();
                    v.dma_active = true;
                    now.start_dma();
                    v.dma_flags |= 0x01;
                    v.dma_base &= 0xF800;
                } else if v.dma_flags & 0x02 != 0 {
                    v.even_events.stop_dma();
                    v.dma_active = true;
                    now.start_dma();
                    v.dma_base |= 0x0400;
                }
            }
            104 => v.out_flags &= 0xF5,
            106 => {
                v.out_flags &= 0xDD;
                reselect = true;
            }
            108 => {
                if v.render_window {
                    if v.dma_pos_counting {
                        v.dma_pos_reload &= v.dma_pos;
                    }
                    v.dma_pos = v.dma_pos_reload;
                    v.dma_pos_counting = true;
                }
                v.even_events.reload_char_position();
            }
            110 => {
                v.fetch_disable &= 0x02;
                if v.fetch_disable == 0 {
                    v.char_pos_counting = true;
                }
            }
            112 => {
                if v.render_window || v.display_window || v.display_active {
                    v.shifter_enabled = true;
                }
            }
            _ => {}
        }
        if reselect {
            self.select_render_function();
        }
    }

    fn odd_column_triggers(&mut self) {
        let v = &mut self.video;
        match v.column {
            43 => {
                if v.vsync != 0 {
                    v.out_flags = (v.out_flags & 0x7F) | (v.vsync & 0x80);
                    self.select_render_function();
                }
            }
            87 => {
                if v.line == 205 {
                    v.odd_events.flash_counter();
                }
            }
            95 => {
                if v.vsync != 0 {
                    v.out_flags = (v.out_flags | 0x80) ^ (v.vsync & 0x80);
                    self.select_render_function();
                }
            }
            _ => {}
        }
    }

    fn dispatch_pending(&mut self, events: u32) {
        if events != 0 {
            self.dispatch_events(events);
        }
    }

    /// DMA read while the CPU is halted; the byte lands on the data bus.
    fn dma_fetch(&mut self) {
        let addr = self.video.dma_base | self.video.dma_pos;
        self.read_bus(self.memory.maps.dma_read, addr);
    }

    fn store_dma_byte(&mut self) {
        let v = &mut self.video;
        let col = v.fetch_column as usize;
        if col < 40 {
            if v.dma_flags & 0x01 != 0 {
                v.attr_fetch[col] = self.io.data_bus;
            }
            if v.dma_flags & 0x02 != 0 {
                v.char_buf[col] = self.io.data_bus;
            }
        }
    }

    fn advance_dma_position(&mut self) {
        if self.video.dma_pos_counting {
            self.video.dma_pos = (self.video.dma_pos + 1) & 0x3FF;
        }
    }

    fn even_timers(&mut self) {
        if self.timers.t1_run {
            if self.timers.t1 == 0 {
                self.regs[0x09] |= 0x08;
                self.update_interrupt_flag();
                self.timers.t1 = self.timers.t1_reload;
            }
            self.timers.t1 = self.timers.t1.wrapping_sub(1);
        }
        if self.timers.t2 == 0 && self.timers.t2_run {
            self.regs[0x09] |= 0x10;
            self.update_interrupt_flag();
        }
        if self.timers.t3 == 0 && self.timers.t3_run {
            self.regs[0x09] |= 0x40;
            self.update_interrupt_flag();
        }
    }

    /// Character or bitmap fetch in the odd half-cycle.
    fn bitmap_fetch(&mut self) {
        let v = &self.video;
        let col = v.fetch_column as usize;
        let f06 = self.regs[0x06];
        let addr = v.sub_line as u16
            | match (f06 & 0x80 != 0, f06 & 0x20 != 0) {
                (false, false) => v.charset_base | (((v.char_buf[col] & v.char_mask) as u16) << 3),
                (false, true) => v.bitmap_base | (v.char_pos << 3),
                (true, false) => ((v.attr_fetch[col] as u16) << 3) | 0xF800,
                (true, true) => {
                    v.bitmap_base | ((v.char_pos & (v.attr_fetch[col] as u16 | 0xFF00)) << 3)
                }
            };
        let base = self.memory.maps.bitmap_read;
        if base & 0x80 == 0 {
            if addr & 0xFFE0 != 0xFF00 {
                if let Some(b) = self.memory.read(AccessKind::BitmapRead, addr) {
                    self.io.data_bus = b;
                }
            } else {
                self.read_bus(self.memory.maps.read, addr);
            }
        } else if addr >= 0x8000 {
            if addr < 0xFC00 {
                if let Some(b) = self.memory.read_slot(base, (addr >> 14) as usize, addr) {
                    self.io.data_bus = b;
                }
            } else if !(0xFD00..0xFF00).contains(&addr) {
                self.read_bus(base, addr);
            }
        }
    }

    /// Bus cycle with nothing to fetch: DRAM refresh or an idle read.
    fn idle_read(&mut self) {
        let base = self.memory.maps.dma_read;
        if self.video.single_clock & 0x80 == 0 {
            self.read_bus(base, 0xFFFF);
        } else {
            let addr = 0xFF00 | self.video.refresh_addr as u16;
            self.read_bus(base, addr);
            self.video.refresh_addr = self.video.refresh_addr.wrapping_add(1);
        }
    }

    /// Move the fetched bytes one stage down the character pipeline.
    fn advance_shift_register(&mut self) {
        let v = &mut self.video;
        v.fetched.bitmap = 0;
        if v.shifter_enabled {
            v.fetched = v.queued;
        }
        if v.fetch_column != 40 {
            let col = v.fetch_column as usize;
            v.queued.attr = v.attr_buf[col];
            v.attr_buf[col] = v.attr_fetch[col];
            v.queued.chr = v.char_buf[col];
            v.fetch_column += 1;
            if v.fetch_column >= 64 {
                v.fetch_column = if v.render_window { 0 } else { 40 };
            }
        } else {
            v.queued.attr = 0;
            v.queued.chr = 0;
        }
        v.queued.bitmap = self.io.data_bus;
        v.queued.flags = if v.char_pos == v.cursor { 0xFF } else { 0x0F } ^ v.mode;
        self.timers.t2 = self.timers.t2.wrapping_sub(self.timers.t2_run as u16);
        self.timers.t3 = self.timers.t3.wrapping_sub(self.timers.t3_run as u16);
    }

    /// Start of the even half-cycle in freeze mode.
    fn freeze_even(&mut self) {
        self.video.even_events.stop_dma();
        self.video.dma_active = false;
        self.video.cpu_halted = false;
        self.set_cpu_running(true);
        let events = self.video.even_events.take();
        self.dispatch_pending(events);
    }

    /// Freeze mode overwrites the flags of the record just emitted.
    fn freeze_fixup(&mut self) {
        let pos = self.video.out_pos - 2;
        self.video.out_buf[pos] = (self.video.out_buf[pos] & 0x01) | 0x30;
    }

    fn end_cycle(&mut self) {
        if let Some(sample) = self.sound.cycle() {
            self.output.play_sample(sample);
        }
        self.regs[0x1E] = self.video.column;
        let v = &mut self.video;
        if !v.frozen {
            v.column = if v.column != 113 { v.column + 1 } else { 0 };
        }
        v.column &= 0x7E;
    }
}

/// Function called once per half-cycle for the phases it is registered on.
pub type PhaseCallbackFn = Box<dyn FnMut(&mut TedChip)>;

struct PhaseCallback {
    key: u32,
    phases: u8,
    func: PhaseCallbackFn,
}

/// The chip driving an attached CPU.
pub struct Ted7360<C: TedCpu> {
    pub cpu: C,
    chip: TedChip,
    callbacks: Vec<PhaseCallback>,
    /// Last values forwarded to the CPU; `None` forces a resend.
    cpu_running_sent: Option<bool>,
    irq_sent: Option<bool>,
}

impl<C: TedCpu> Ted7360<C> {
    pub fn new(cpu: C) -> Self {
        Self::with_chip(cpu, TedChip::new())
    }

    pub fn with_chip(cpu: C, chip: TedChip) -> Self {
        Self {
            cpu,
            chip,
            callbacks: Vec::new(),
            cpu_running_sent: None,
            irq_sent: None,
        }
    }

    pub fn chip(&self) -> &TedChip {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut TedChip {
        &mut self.chip
    }

    pub fn configure_ram(&mut self, size_kib: u32, pattern: u64) -> Result<(), TedError> {
        self.chip.configure_ram(size_kib, pattern)?;
        self.sync_cpu_lines();
        Ok(())
    }

    pub fn load_rom(&mut self, bank: u8, offset: usize, data: Option<&[u8]>) {
        self.chip.load_rom(bank, offset, data);
    }

    pub fn set_cpu_clock_multiplier(&mut self, multiplier: i32) {
        self.chip.set_cpu_clock_multiplier(multiplier);
    }

    /// Press or release a key (0..=63) or joystick contact (72..=86).
    pub fn set_key_state(&mut self, key: u8, pressed: bool) {
        self.chip.set_key_state(key, pressed);
    }

    /// Reset the chip and the CPU; a cold reset also reinitializes every
    /// chip register.
    pub fn reset(&mut self, cold: bool) {
        self.chip.reset_registers(cold);
        self.cpu.reset(cold);
        self.cpu_running_sent = None;
        self.irq_sent = None;
        self.sync_cpu_lines();
        log(LogCategory::CPU, LogLevel::Info, || {
            format!("{} reset", if cold { "cold" } else { "warm" })
        });
    }

    /// Register `func` under `key` for the phases in `phases`
    /// ([`PHASE_EVEN`] | [`PHASE_ODD`]). Registering an existing key
    /// replaces it and moves it to the end of the call order; an empty
    /// phase set removes it.
    pub fn set_callback(
        &mut self,
        key: u32,
        phases: u8,
        func: PhaseCallbackFn,
    ) -> Result<(), TedError> {
        let phases = phases & (PHASE_EVEN | PHASE_ODD);
        match self.callbacks.iter().position(|c| c.key == key) {
            Some(i) => {
                self.callbacks.remove(i);
            }
            None if phases != 0 && self.callbacks.len() >= MAX_CALLBACKS => {
                return Err(TedError::TooManyCallbacks);
            }
            None => {}
        }
        if phases != 0 {
            self.callbacks.push(PhaseCallback { key, phases, func });
        }
        Ok(())
    }

    pub fn remove_callback(&mut self, key: u32) {
        self.callbacks.retain(|c| c.key != key);
    }

    /// Run for `ticks` input clock ticks (17734475 Hz PAL, 14318180 Hz
    /// NTSC). Whole cycles are executed while the budget, including the
    /// overrun of the previous call, is not negative. Returns the new
    /// overrun (<= 0).
    pub fn run(&mut self, ticks: i32) -> Result<i32, TedError> {
        if ticks < 0 {
            return Err(TedError::InvalidArgument(format!(
                "negative cycle count: {}",
                ticks
            )));
        }
        let mut n = self.chip.video.cycle_carry.saturating_add(ticks);
        while n >= 0 {
            self.run_cycle();
            n -= self.chip.video.cycle_len;
        }
        self.chip.video.cycle_carry = n;
        self.sync_cpu_lines();
        Ok(n)
    }

    fn run_cycle(&mut self) {
        self.chip.begin_cycle();
        if !self.chip.video.frozen {
            self.even_half();
        } else {
            self.frozen_half();
        }
        self.chip.regs[0x1E] = self.chip.video.column;
        self.chip.video.column |= 0x01;

        let events = self.chip.video.odd_events.take();
        self.chip.dispatch_pending(events);
        if !self.chip.video.frozen {
            self.odd_half();
        } else {
            self.frozen_half();
        }
        self.chip.end_cycle();
    }

    fn even_half(&mut self) {
        let mut now = DelayedEvents(self.chip.video.even_events.take());
        self.chip.even_column_triggers(&mut now);
        self.chip.dispatch_pending(now.0);
        self.run_callbacks(PHASE_EVEN);
        self.sync_cpu_lines();
        let multiplier = self.chip.cpu_clock_multiplier;
        if self.chip.video.cpu_running {
            self.cpu.run_rdy_high(&mut self.chip, multiplier);
        } else {
            if self.chip.video.cpu_halted {
                self.chip.dma_fetch();
            } else {
                self.cpu.run_rdy_low(&mut self.chip, multiplier);
            }
            self.chip.store_dma_byte();
        }
        self.chip.advance_dma_position();
        let hscroll = self.chip.video.hscroll as i32;
        self.chip.render(hscroll);
        self.chip.even_timers();
    }

    fn odd_half(&mut self) {
        self.chip.odd_column_triggers();
        self.run_callbacks(PHASE_ODD);
        if self.chip.video.single_clock == 0 {
            self.sync_cpu_lines();
            let multiplier = self.chip.cpu_clock_multiplier;
            self.cpu.run_rdy_high(&mut self.chip, multiplier);
        } else if self.chip.video.fetch_disable == 0 {
            self.chip.bitmap_fetch();
        } else {
            self.chip.idle_read();
        }
        let hscroll = self.chip.video.hscroll as i32;
        self.chip.render(hscroll - 4);
        self.chip.advance_shift_register();
    }

    /// Freeze mode: no video fetches, blank output, CPU always running.
    fn frozen_half(&mut self) {
        let multiplier = self.chip.cpu_clock_multiplier;
        let hscroll = self.chip.video.hscroll as i32;
        if self.chip.video.column & 0x01 == 0 {
            self.chip.freeze_even();
            self.run_callbacks(PHASE_EVEN);
            self.sync_cpu_lines();
            self.cpu.run_rdy_high(&mut self.chip, multiplier);
            self.chip.advance_dma_position();
            self.chip.render_blank(hscroll);
        } else {
            self.run_callbacks(PHASE_ODD);
            if self.chip.video.single_clock == 0 {
                self.sync_cpu_lines();
                self.cpu.run_rdy_high(&mut self.chip, multiplier);
            } else {
                self.chip.idle_read();
            }
            self.chip.render_blank(hscroll - 4);
        }
        self.chip.freeze_fixup();
    }

    fn run_callbacks(&mut self, phase: u8) {
        for cb in self.callbacks.iter_mut().filter(|c| c.phases & phase != 0) {
            (cb.func)(&mut self.chip);
        }
    }

    /// Forward RDY and IRQ changes to the CPU.
    fn sync_cpu_lines(&mut self) {
        let running = self.chip.video.cpu_running;
        if self.cpu_running_sent != Some(running) {
            self.cpu.set_is_cpu_running(running);
            self.cpu_running_sent = Some(running);
        }
        let irq = self.chip.io.irq;
        if self.irq_sent != Some(irq) {
            self.cpu.interrupt_request(irq);
            self.irq_sent = Some(irq);
        }
    }

    /// Forget what the CPU was last told, e.g. after restoring a snapshot.
    pub(crate) fn resync_cpu(&mut self) {
        self.cpu_running_sent = None;
        self.irq_sent = None;
        self.sync_cpu_lines();
    }
}
