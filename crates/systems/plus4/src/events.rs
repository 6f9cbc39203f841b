//! Delayed micro-operations.
//!
//! Register writes and column triggers do not always take effect at once:
//! many effects appear one half-cycle or one full cycle later on the real
//! chip. Each pending effect is a bit in one of two masks, one consumed at
//! the start of the even half-cycle and one at the start of the odd
//! half-cycle. Bits are applied lowest first; an operation may schedule
//! further operations into either mask, and "second half of line increment"
//! may add "vertical scroll check" to the mask being dispatched.

use crate::render::Renderer;
use crate::ted::TedChip;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Bit positions, in dispatch order.
mod bit {
    pub const REFRESH_ON: u32 = 0;
    pub const REFRESH_OFF: u32 = 1;
    pub const NEXT_LINE: u32 = 2;
    pub const LINE_REGISTERS: u32 = 3;
    pub const STOP_DMA_COUNT: u32 = 4;
    pub const LATCH_DMA_POSITION: u32 = 5;
    pub const LATCH_CHAR_POSITION: u32 = 6;
    pub const INIT_DISPLAY: u32 = 7;
    pub const NEXT_LINE_2: u32 = 8;
    pub const NEXT_SUB_LINE: u32 = 9;
    pub const SUB_LINE_REGISTER: u32 = 10;
    /// One bit per color register, FF15 to FF19.
    pub const COLOR_0: u32 = 11;
    pub const COLOR_4: u32 = 15;
    pub const RELOAD_CHAR_POSITION: u32 = 16;
    pub const SINGLE_CLOCK_ON: u32 = 17;
    pub const DMA_CYCLE_1: u32 = 18;
    pub const DMA_CYCLE_2: u32 = 19;
    pub const DMA_CYCLE_3: u32 = 20;
    pub const DMA_CYCLE_4: u32 = 21;
    pub const DMA_CYCLE_5: u32 = 22;
    pub const ABORT_DMA: u32 = 23;
    pub const TIMER2_START: u32 = 24;
    pub const VERTICAL_SCROLL: u32 = 25;
    pub const HORIZONTAL_SCROLL: u32 = 26;
    pub const SELECT_RENDERER: u32 = 27;
    pub const FORCE_SINGLE_CLOCK: u32 = 28;
    pub const CHAR_POS_REGISTERS: u32 = 29;
    pub const RESET_SUB_LINE: u32 = 30;
    pub const FLASH_COUNTER: u32 = 31;
}

const REFRESH_ON: u32 = 1 << bit::REFRESH_ON;
const REFRESH_OFF: u32 = 1 << bit::REFRESH_OFF;
const NEXT_LINE: u32 = 1 << bit::NEXT_LINE;
const LINE_REGISTERS: u32 = 1 << bit::LINE_REGISTERS;
const STOP_DMA_COUNT: u32 = 1 << bit::STOP_DMA_COUNT;
const LATCH_DMA_POSITION: u32 = 1 << bit::LATCH_DMA_POSITION;
const LATCH_CHAR_POSITION: u32 = 1 << bit::LATCH_CHAR_POSITION;
const INIT_DISPLAY: u32 = 1 << bit::INIT_DISPLAY;
const NEXT_LINE_2: u32 = 1 << bit::NEXT_LINE_2;
const NEXT_SUB_LINE: u32 = 1 << bit::NEXT_SUB_LINE;
pub(crate) const SUB_LINE_REGISTER: u32 = 1 << bit::SUB_LINE_REGISTER;
const COLOR_0: u32 = 1 << bit::COLOR_0;
const RELOAD_CHAR_POSITION: u32 = 1 << bit::RELOAD_CHAR_POSITION;
const SINGLE_CLOCK_ON: u32 = 1 << bit::SINGLE_CLOCK_ON;
const DMA_CYCLE_1: u32 = 1 << bit::DMA_CYCLE_1;
const DMA_CYCLE_2: u32 = 1 << bit::DMA_CYCLE_2;
const DMA_CYCLE_3: u32 = 1 << bit::DMA_CYCLE_3;
const DMA_CYCLE_5: u32 = 1 << bit::DMA_CYCLE_5;
const ABORT_DMA: u32 = 1 << bit::ABORT_DMA;
const TIMER2_START: u32 = 1 << bit::TIMER2_START;
const VERTICAL_SCROLL: u32 = 1 << bit::VERTICAL_SCROLL;
const HORIZONTAL_SCROLL: u32 = 1 << bit::HORIZONTAL_SCROLL;
const SELECT_RENDERER: u32 = 1 << bit::SELECT_RENDERER;
const FORCE_SINGLE_CLOCK: u32 = 1 << bit::FORCE_SINGLE_CLOCK;
pub(crate) const CHAR_POS_REGISTERS: u32 = 1 << bit::CHAR_POS_REGISTERS;
const RESET_SUB_LINE: u32 = 1 << bit::RESET_SUB_LINE;
const FLASH_COUNTER: u32 = 1 << bit::FLASH_COUNTER;

/// DMA_CYCLE_1..=DMA_CYCLE_5 and ABORT_DMA
const DMA_SEQUENCE: u32 = 0x00FC_0000;

/// A set of pending micro-operations for one half-cycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedEvents(pub u32);

impl DelayedEvents {
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    /// Return the pending set and leave this one empty.
    pub fn take(&mut self) -> u32 {
        std::mem::take(&mut self.0)
    }

    pub fn refresh_on(&mut self) {
        self.0 |= REFRESH_ON;
    }
    pub fn refresh_off(&mut self) {
        self.0 |= REFRESH_OFF;
    }
    pub fn next_line(&mut self) {
        self.0 |= NEXT_LINE;
    }
    pub fn line_registers(&mut self) {
        self.0 |= LINE_REGISTERS;
    }
    pub fn stop_dma_count(&mut self) {
        self.0 |= STOP_DMA_COUNT;
    }
    pub fn latch_dma_position(&mut self) {
        self.0 |= LATCH_DMA_POSITION;
    }
    pub fn latch_char_position(&mut self) {
        self.0 |= LATCH_CHAR_POSITION;
    }
    pub fn init_display(&mut self) {
        self.0 |= INIT_DISPLAY;
    }
    pub fn next_line_2(&mut self) {
        self.0 |= NEXT_LINE_2;
    }
    pub fn next_sub_line(&mut self) {
        self.0 |= NEXT_SUB_LINE;
    }
    pub fn sub_line_register(&mut self) {
        self.0 |= SUB_LINE_REGISTER;
    }
    /// Latch color register `n` (0 = FF15 .. 4 = FF19).
    pub fn color(&mut self, n: usize) {
        self.0 |= COLOR_0 << n;
    }
    pub fn reload_char_position(&mut self) {
        self.0 |= RELOAD_CHAR_POSITION;
    }
    pub fn single_clock_on(&mut self) {
        self.0 |= SINGLE_CLOCK_ON;
    }
    /// Cancel any DMA sequence in progress and begin a new one.
    pub fn start_dma(&mut self) {
        self.0 = (self.0 & !DMA_SEQUENCE) | DMA_CYCLE_1;
    }
    pub fn stop_dma(&mut self) {
        self.0 &= !DMA_SEQUENCE;
    }
    /// Schedule step `n` (2..=5) of the DMA sequence.
    pub fn dma_cycle(&mut self, n: u32) {
        self.0 |= DMA_CYCLE_1 << (n - 1);
    }
    pub fn abort_dma(&mut self) {
        self.0 |= ABORT_DMA;
    }
    pub fn timer2_start(&mut self) {
        self.0 |= TIMER2_START;
    }
    pub fn cancel_timer2_start(&mut self) {
        self.0 &= !TIMER2_START;
    }
    pub fn vertical_scroll(&mut self) {
        self.0 |= VERTICAL_SCROLL;
    }
    pub fn horizontal_scroll(&mut self) {
        self.0 |= HORIZONTAL_SCROLL;
    }
    pub fn select_renderer(&mut self) {
        self.0 |= SELECT_RENDERER;
    }
    pub fn force_single_clock(&mut self) {
        self.0 |= FORCE_SINGLE_CLOCK;
    }
    pub fn char_pos_registers(&mut self) {
        self.0 |= CHAR_POS_REGISTERS;
    }
    pub fn reset_sub_line(&mut self) {
        self.0 |= RESET_SUB_LINE;
    }
    pub fn flash_counter(&mut self) {
        self.0 |= FLASH_COUNTER;
    }
}

impl TedChip {
    /// Apply every operation in `n`, lowest bit first.
    pub(crate) fn dispatch_events(&mut self, mut n: u32) {
        while n != 0 {
            let index = n.trailing_zeros();
            n &= n - 1;
            match index {
                bit::REFRESH_ON => {
                    self.video.single_clock = (self.video.single_clock & 0x02) | 0x80;
                }
                bit::REFRESH_OFF => self.video.single_clock &= 0x03,
                bit::NEXT_LINE => self.next_line(),
                bit::LINE_REGISTERS => {
                    self.check_dma_position_reset();
                    self.regs[0x1D] = (self.video.line & 0xFF) as u8;
                    self.regs[0x1C] = ((self.video.line & 0x100) >> 8) as u8;
                    self.check_raster_interrupt();
                }
                bit::STOP_DMA_COUNT => {
                    self.video.dma_pos_counting = false;
                    if self.video.line == 205 {
                        self.video.dma_pos_reload = 0x3FF;
                    }
                }
                bit::LATCH_DMA_POSITION => self.video.dma_pos_reload = self.video.dma_pos,
                bit::LATCH_CHAR_POSITION => {
                    self.video.char_pos_reload = (self.video.char_pos + 1) & 0x3FF;
                    self.video.odd_events.char_pos_registers();
                }
                bit::INIT_DISPLAY => {
                    self.video.dma_enabled = true;
                    if !self.video.render_window {
                        self.video.render_window = true;
                        self.video.odd_events.reset_sub_line();
                        if self.video.ext_fetch {
                            self.video.even_events.single_clock_on();
                        }
                    }
                }
                bit::NEXT_LINE_2 => {
                    if self.next_line_second_half() {
                        n |= VERTICAL_SCROLL;
                    }
                }
                bit::NEXT_SUB_LINE => {
                    self.video.sub_line = (self.video.sub_line + 1) & 7;
                    self.video.odd_events.sub_line_register();
                }
                bit::SUB_LINE_REGISTER => {
                    self.regs[0x1F] = (self.regs[0x1F] & 0xF8) | self.video.sub_line;
                }
                bit::COLOR_0..=bit::COLOR_4 => {
                    let i = (index - bit::COLOR_0) as usize;
                    self.video.colors[i] = self.regs[0x15 + i];
                }
                bit::RELOAD_CHAR_POSITION => {
                    self.video.char_pos_latch = self.video.char_pos_reload;
                    self.video.char_pos = self.video.char_pos_latch;
                }
                bit::SINGLE_CLOCK_ON => self.video.single_clock |= 0x01,
                bit::DMA_CYCLE_1 => {
                    self.video.single_clock |= self.video.render_window as u8;
                    self.video.even_events.dma_cycle(2);
                }
                bit::DMA_CYCLE_2 => {
                    self.set_cpu_running(false);
                    self.video.single_clock |= 0x01;
                    self.video.even_events.dma_cycle(3);
                }
                bit::DMA_CYCLE_3 => self.video.even_events.dma_cycle(4),
                bit::DMA_CYCLE_4 => self.video.even_events.dma_cycle(5),
                bit::DMA_CYCLE_5 => self.video.cpu_halted = true,
                bit::ABORT_DMA => self.end_dma(),
                bit::TIMER2_START => self.timers.t2_run = true,
                bit::VERTICAL_SCROLL => self.apply_vertical_scroll(),
                bit::HORIZONTAL_SCROLL => self.video.hscroll = self.regs[0x07] & 0x07,
                bit::SELECT_RENDERER => {
                    self.video.mode_renderer = match self.video.mode & 0x07 {
                        0 => Renderer::CharStd,
                        1 => Renderer::CharMulticolor,
                        2 => Renderer::BitmapHires,
                        3 => Renderer::BitmapMulticolor,
                        4 => Renderer::CharExtendedColor,
                        _ => Renderer::Blank,
                    };
                    log(LogCategory::Video, LogLevel::Debug, || {
                        format!(
                            "renderer: {:?} (mode 0x{:X}, line {})",
                            self.video.mode_renderer, self.video.mode, self.video.line
                        )
                    });
                    self.select_render_function();
                }
                bit::FORCE_SINGLE_CLOCK => {
                    self.video.single_clock =
                        (self.video.single_clock & 0x81) | (self.regs[0x13] & 0x02);
                }
                bit::CHAR_POS_REGISTERS => {
                    self.regs[0x1A] = (self.video.char_pos_reload >> 8) as u8;
                    self.regs[0x1B] = (self.video.char_pos_reload & 0xFF) as u8;
                }
                bit::RESET_SUB_LINE => {
                    self.video.sub_line = 7;
                    self.video.prev_sub_line = 7;
                    self.video.even_events.sub_line_register();
                }
                bit::FLASH_COUNTER.. => {
                    self.regs[0x1F] = (self.regs[0x1F] & 0x7F).wrapping_add(0x08);
                    if self.regs[0x1F] & 0x80 != 0 {
                        self.video.flash ^= 0xFF;
                    }
                }
            }
        }
    }

    /// End the DMA currently in progress and give the bus back to the CPU.
    pub(crate) fn end_dma(&mut self) {
        self.video.even_events.stop_dma();
        self.video.dma_active = false;
        self.video.cpu_halted = false;
        self.set_cpu_running(true);
    }

    /// First half of the line increment (column 96).
    fn next_line(&mut self) {
        let v = &mut self.video;
        v.dma_flags &= 0x80;
        if (v.line_delayed & 7) == v.vscroll as u16 && v.dma_enabled {
            v.dma_flags |= 0x02;
        } else if v.dma_active {
            v.even_events.abort_dma();
        }
        v.out_flags &= 0xF9;
        v.out_flags |= (((v.line_latch & !(v.out_flags as u16)) & 1) << 2) as u8;
        v.line_latch = (v.line + 1) & 0x1FF;
        v.render_window |= v.dma_enabled;
        let line = v.line_latch;
        if (226..=269).contains(&line) {
            self.check_vertical_events();
        } else if line <= 8 {
            if self.regs[0x06] & 0x10 != 0 {
                if line == 0 {
                    self.video.even_events.init_display();
                }
                if line == 8 - ((self.regs[0x06] & 0x08) >> 1) as u16 {
                    self.video.display_window = true;
                }
            }
        } else if (200..=204).contains(&line) {
            if line == 200 + ((self.regs[0x06] & 0x08) >> 1) as u16 {
                self.video.display_window = false;
            }
            if line == 204 {
                self.video.render_window = false;
                self.video.sub_line_counting &= self.video.dma_enabled;
            }
        }
        let v = &mut self.video;
        v.line = v.line_latch;
        v.prev_sub_line = v.sub_line;
        v.odd_events.line_registers();
        v.even_events.next_line_2();
    }

    /// Second half of the line increment; returns true when the vertical
    /// scroll check must run in the same dispatch (the horizontal counter
    /// was moved away from column 100 by a FF1E write).
    fn next_line_second_half(&mut self) -> bool {
        let scroll = self.regs[0x06];
        let v = &mut self.video;
        v.line_delayed = v.line_latch;
        if v.line_latch == 203 {
            v.dma_enabled = false;
        }
        if v.line_latch == 204 {
            v.fetch_disable |= 0x02;
            v.single_clock &= 0x82;
        } else if v.render_window {
            if ((v.line_delayed ^ scroll as u16) & 7) == 0 && v.dma_enabled {
                v.sub_line_counting = true;
            }
            if v.dma_flags & 0x02 != 0 {
                v.fetch_disable &= 0x01;
            }
        }
        v.column != 100
    }

    /// FF06 bits 0-2 take effect; may start or abort a DMA.
    fn apply_vertical_scroll(&mut self) {
        let v = &mut self.video;
        v.vscroll = self.regs[0x06] & 0x07;
        if !v.render_window {
            return;
        }
        if (v.line_delayed & 7) == v.vscroll as u16 {
            if v.dma_enabled {
                v.sub_line_counting = true;
                if v.column == 98 {
                    v.even_events.next_sub_line();
                }
                if v.dma_flags & 0x80 != 0 {
                    if !v.dma_active {
                        v.dma_active = true;
                        v.single_clock |= 0x01;
                        v.even_events.dma_cycle(2);
                    }
                    v.dma_flags |= 0x01;
                    v.dma_base &= 0xF800;
                }
            }
        } else {
            v.dma_flags &= 0x82;
            if v.dma_flags & 0x03 == 0 {
                if v.dma_active {
                    v.even_events.abort_dma();
                }
            } else {
                v.dma_base |= 0x0400;
            }
        }
    }

    /// Sync, blanking and burst edges at the bottom of the frame.
    pub(crate) fn check_vertical_events(&mut self) {
        let ntsc = self.video.out_flags & 0x01 != 0;
        let edges: [u16; 5] = if ntsc {
            [226, 229, 232, 235, 244]
        } else {
            [251, 254, 257, 260, 269]
        };
        let v = &mut self.video;
        let line = v.line_latch;
        let reselect = if line == edges[0] {
            v.out_flags = (v.out_flags & 0xF7) | 0x10;
            v.vsync |= 0x40;
            true
        } else if line == edges[1] {
            v.out_flags |= 0x40;
            v.vsync |= 0x80;
            false
        } else if line == edges[2] {
            v.out_flags &= 0xBD;
            v.vsync &= 0x40;
            false
        } else if line == edges[3] {
            v.out_flags &= 0x7D;
            v.vsync &= 0x80;
            true
        } else if line == edges[4] {
            v.out_flags &= 0xED;
            if v.column == 98 {
                v.out_flags |= 0x08;
            }
            true
        } else {
            false
        };
        if reselect {
            self.select_render_function();
        }
    }

    pub(crate) fn check_dma_position_reset(&mut self) {
        if self.video.line == 205 && !self.video.dma_pos_counting {
            self.video.dma_pos_reload = 0x3FF;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ted::tests::chip;

    #[test]
    fn test_dma_sequence_masks() {
        let mut ev = DelayedEvents::default();
        ev.abort_dma();
        ev.timer2_start();
        ev.start_dma();
        assert!(ev.contains(DMA_CYCLE_1));
        assert!(!ev.contains(ABORT_DMA));
        assert!(ev.contains(TIMER2_START));
        ev.dma_cycle(3);
        assert!(ev.contains(DMA_CYCLE_3));
        ev.stop_dma();
        assert_eq!(ev.0, TIMER2_START);
        ev.cancel_timer2_start();
        assert!(ev.is_empty());
    }

    #[test]
    fn test_color_bits() {
        let mut ev = DelayedEvents::default();
        ev.color(0);
        ev.color(4);
        assert_eq!(ev.0, COLOR_0 | COLOR_0 << 4);
    }

    #[test]
    fn test_dispatch_cascades_into_next_phase() {
        let mut ted = chip();
        ted.video.render_window = false;
        ted.video.ext_fetch = true;
        ted.dispatch_events(INIT_DISPLAY);
        assert!(ted.video.render_window);
        assert!(ted.video.dma_enabled);
        assert!(ted.video.odd_events.contains(RESET_SUB_LINE));
        assert!(ted.video.even_events.contains(SINGLE_CLOCK_ON));

        let odd = ted.video.odd_events.take();
        ted.dispatch_events(odd);
        assert_eq!(ted.video.sub_line, 7);
        assert!(ted.video.even_events.contains(SUB_LINE_REGISTER));
    }

    #[test]
    fn test_line_increment_order() {
        let mut ted = chip();
        ted.video.line = 9;
        ted.video.column = 96;
        ted.dispatch_events(NEXT_LINE);
        assert_eq!(ted.video.line, 10);
        assert_eq!(ted.video.line_latch, 10);
        // the register copy is delayed to the odd phase
        assert_eq!(ted.regs[0x1D], 0);
        assert!(ted.video.odd_events.contains(LINE_REGISTERS));
        assert!(ted.video.even_events.contains(NEXT_LINE_2));

        let odd = ted.video.odd_events.take();
        ted.dispatch_events(odd);
        assert_eq!(ted.regs[0x1D], 10);
        assert_eq!(ted.regs[0x1C], 0);
    }

    #[test]
    fn test_second_half_adds_scroll_check_when_column_moved() {
        let mut ted = chip();
        ted.regs[0x06] = 0x1D;
        ted.video.vscroll = 3;
        ted.video.column = 50;
        ted.dispatch_events(NEXT_LINE_2);
        assert_eq!(ted.video.vscroll, 5);

        let mut ted = chip();
        ted.regs[0x06] = 0x1D;
        ted.video.vscroll = 3;
        ted.video.column = 100;
        ted.dispatch_events(NEXT_LINE_2);
        assert_eq!(ted.video.vscroll, 3);
    }

    #[test]
    fn test_flash_counter_toggles_every_sixteen_steps() {
        let mut ted = chip();
        ted.regs[0x1F] = 0;
        ted.video.flash = 0;
        for _ in 0..15 {
            ted.dispatch_events(FLASH_COUNTER);
        }
        assert_eq!(ted.video.flash, 0);
        ted.dispatch_events(FLASH_COUNTER);
        assert_eq!(ted.video.flash, 0xFF);
        assert_eq!(ted.regs[0x1F] & 0x78, 0);
    }

    #[test]
    fn test_dma_steps_halt_cpu() {
        let mut ted = chip();
        ted.video.render_window = true;
        ted.video.cpu_running = true;
        ted.dispatch_events(DMA_CYCLE_1);
        assert_eq!(ted.video.single_clock & 1, 1);
        let next = ted.video.even_events.take();
        assert_eq!(next, DMA_CYCLE_2);
        ted.dispatch_events(next);
        assert!(!ted.video.cpu_running);
        for _ in 0..3 {
            let next = ted.video.even_events.take();
            ted.dispatch_events(next);
        }
        assert!(ted.video.cpu_halted);
        ted.dispatch_events(ABORT_DMA);
        assert!(!ted.video.cpu_halted);
        assert!(ted.video.cpu_running);
    }

    #[test]
    fn test_pal_vertical_sync_edges() {
        let mut ted = chip();
        ted.video.out_flags = 0x08;
        ted.video.line_latch = 251;
        ted.check_vertical_events();
        assert_eq!(ted.video.out_flags, 0x10);
        assert_eq!(ted.video.vsync, 0x40);
        ted.video.line_latch = 254;
        ted.check_vertical_events();
        assert_eq!(ted.video.out_flags, 0x50);
        assert_eq!(ted.video.vsync, 0xC0);
        ted.video.line_latch = 257;
        ted.check_vertical_events();
        assert_eq!(ted.video.out_flags, 0x10);
        assert_eq!(ted.video.vsync, 0x40);
        ted.video.line_latch = 260;
        ted.check_vertical_events();
        assert_eq!(ted.video.vsync, 0x00);
        ted.video.line_latch = 269;
        ted.check_vertical_events();
        assert_eq!(ted.video.out_flags & 0x10, 0);
        assert_eq!(ted.video.renderer, Renderer::Border);
    }

    #[test]
    fn test_dispatch_every_bit_position() {
        let mut ted = chip();
        for i in 0..5 {
            ted.regs[0x15 + i] = 0x10 + i as u8;
        }
        ted.timers.t2_run = false;
        let flash_steps = ted.regs[0x1F] >> 3;
        ted.dispatch_events(u32::MAX);
        assert_eq!(ted.video.colors, [0x10, 0x11, 0x12, 0x13, 0x14]);
        assert!(ted.timers.t2_run);
        assert_eq!((ted.regs[0x1F] >> 3) & 0x0F, (flash_steps + 1) & 0x0F);
    }
}
