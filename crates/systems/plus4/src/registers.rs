//! CPU-bus address decoder and the TED register file.
//!
//! Every CPU access goes through [`TedChip::read_bus`] / [`TedChip::write_bus`].
//! The decoder intercepts the processor port (0000-0001), the I/O area at
//! FD00-FDFF, the TED registers at FF00-FF1F and the ROM/RAM switch at
//! FF3E-FF3F; everything else goes to the memory map.

use crate::cpu::CpuBus;
use crate::events::{DelayedEvents, CHAR_POS_REGISTERS, SUB_LINE_REGISTER};
use crate::render::Renderer;
use crate::ted::TedChip;
use emu_core::apu::{AudioChip, TimingMode};
use emu_core::logging::{log, LogCategory, LogLevel};

/// Outcome of decoding a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRead {
    /// A device drove the data bus with this value.
    Driven(u8),
    /// Answered inside the CPU package; the external bus is not touched.
    Internal(u8),
    /// Nothing responded.
    Open,
}

impl CpuBus for TedChip {
    fn read_memory(&mut self, addr: u16) -> u8 {
        self.read_bus(self.memory.maps.read, addr)
    }

    fn write_memory(&mut self, addr: u16, value: u8) {
        self.write_bus(addr, value);
    }
}

impl TedChip {
    /// Read `addr` through the map row at `base`; open bus returns the last
    /// value driven on the data bus.
    pub fn read_bus(&mut self, base: u16, addr: u16) -> u8 {
        match self.decode_read(base, addr) {
            BusRead::Driven(v) => {
                self.io.data_bus = v;
                v
            }
            BusRead::Internal(v) => v,
            BusRead::Open => self.io.data_bus,
        }
    }

    /// Read memory as the CPU would see it, without touching the bus.
    /// `force_ram` ignores the ROM selection.
    pub fn read_memory_cpu(&self, addr: u16, force_ram: bool) -> u8 {
        let base = if force_ram {
            self.memory.maps.cpu_read & 0x7F78
        } else {
            self.memory.maps.cpu_read
        };
        match self.decode_read(base, addr) {
            BusRead::Driven(v) | BusRead::Internal(v) => v,
            BusRead::Open => 0xFF,
        }
    }

    pub fn decode_read(&self, base: u16, addr: u16) -> BusRead {
        match addr {
            0x0000 => BusRead::Internal(self.io.port_dir),
            0x0001 => BusRead::Internal(self.port_read()),
            0xFD00..=0xFD0F => {
                log(LogCategory::Stubs, LogLevel::Trace, || {
                    format!("read of unmapped ACIA register 0x{:04X}", addr)
                });
                BusRead::Open
            }
            0xFD16 => BusRead::Driven(if self.memory.ram_segments() < 16 {
                self.user_port_input()
            } else {
                self.io.hannes
            }),
            0xFD10..=0xFD1F => BusRead::Driven(self.user_port_input()),
            0xFD30..=0xFD3F => BusRead::Driven(self.io.kbd_select as u8),
            0xFF00..=0xFF1F => BusRead::Driven(self.read_register((addr & 0x1F) as usize)),
            // the ROM/RAM switch drives 0xFF while RAM is selected
            0xFF3E | 0xFF3F if base & 0x80 == 0 => BusRead::Driven(0xFF),
            _ => match self.memory.read_mapped(base, addr) {
                Some(v) => BusRead::Driven(v),
                None => BusRead::Open,
            },
        }
    }

    /// Processor port input: bit 4 is the cassette read line.
    fn port_read(&self) -> u8 {
        let input = if self.io.tape_read { 0xDF } else { 0xCF };
        (self.io.port_out & self.io.port_dir) | (input & !self.io.port_dir)
    }

    /// User port as read back; bit 2 reflects the cassette sense button.
    fn user_port_input(&self) -> u8 {
        let button = if self.io.tape_button { 0xFB } else { 0xFF };
        self.io.user_port & button
    }

    fn read_register(&self, n: usize) -> u8 {
        let r = self.regs[n];
        let pending =
            |bits: u32| self.video.even_events.contains(bits) || self.video.odd_events.contains(bits);
        match n {
            0x00 => self.timers.t1 as u8,
            0x01 => (self.timers.t1 >> 8) as u8,
            0x02 => self.timers.t2 as u8,
            0x03 => (self.timers.t2 >> 8) as u8,
            0x04 => self.timers.t3 as u8,
            0x05 => (self.timers.t3 >> 8) as u8,
            0x09 => (r & 0x5E) | 0x21 | ((self.io.irq as u8) << 7),
            0x0A => r | 0xA0,
            0x0C => r | 0xFC,
            0x10 => r | 0xFC,
            0x12 => r | 0xC0,
            0x13 => (r & 0xFE) | (self.memory.maps.cpu_read & 0x80 != 0) as u8,
            0x14 => r | 0x07,
            // a reload latched this cycle is still settling into the register
            0x1A => {
                let mut v = r;
                if pending(CHAR_POS_REGISTERS) {
                    v &= (self.video.char_pos_reload >> 8) as u8;
                }
                v | 0xFC
            }
            0x1B => {
                if pending(CHAR_POS_REGISTERS) {
                    r & (self.video.char_pos_reload & 0xFF) as u8
                } else {
                    r
                }
            }
            0x1C => r | 0xFE,
            0x1E => r << 1,
            0x1F => {
                let mut v = r;
                if pending(SUB_LINE_REGISTER) {
                    v &= (r & 0xF8) | self.video.sub_line;
                }
                v | 0x80
            }
            _ => r,
        }
    }

    /// Write `value` to `addr` as the CPU would.
    pub fn write_bus(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000 => {
                self.io.port_dir = value & 0xDF;
                self.write_port(self.io.port_out);
            }
            0x0001 => self.write_port(value),
            0xFD16 => {
                self.io.data_bus = value;
                self.write_hannes(value);
            }
            0xFD10..=0xFD1F => {
                self.io.data_bus = value;
                if self.memory.ram_segments() < 16 || addr & 0x0F == 0 {
                    self.io.user_port = value;
                }
            }
            0xFD30..=0xFD3F => {
                self.io.data_bus = value;
                self.io.kbd_select = value as u16 | 0xFF00;
            }
            0xFDD0..=0xFDDF => {
                self.io.data_bus = value;
                let banks = (addr & 0x0F) << 11;
                self.memory.maps.update_reads(|m| (m & 0x07F8) | banks);
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!(
                        "ROM banks: low {}, high {}",
                        addr & 0x03,
                        (addr >> 2) & 0x03
                    )
                });
            }
            0xFF00..=0xFF1F => self.write_register((addr & 0x1F) as usize, value),
            0xFF3E => {
                self.io.data_bus = value;
                let maps = &mut self.memory.maps;
                maps.read |= 0x80;
                maps.cpu_read |= 0x80;
                maps.dma_read |= 0x80;
            }
            0xFF3F => {
                self.io.data_bus = value;
                let maps = &mut self.memory.maps;
                maps.read &= 0x7F78;
                maps.cpu_read &= 0x7F78;
                maps.dma_read &= 0x7F78;
            }
            _ => {
                self.io.data_bus = value;
                self.memory.write(addr, value);
            }
        }
    }

    /// Output latch of the processor port. Bits 6 and 7 read back high
    /// when driven low, which pulls the cassette lines.
    fn write_port(&mut self, value: u8) {
        self.io.port_out = value;
        let mut lines = value | !self.io.port_dir;
        let low = !lines;
        lines |= ((low & 0x80) >> 7) | ((low & 0x40) >> 5);
        self.io.tape_motor = lines & 0x08 == 0;
        self.io.tape_write = lines & 0x02 != 0;
    }

    /// FD16: RAM bank register of the Hannes expansion; without expansion
    /// RAM the address is just part of the user port.
    fn write_hannes(&mut self, value: u8) {
        let rs = self.memory.ram_segments();
        if rs < 16 {
            self.io.user_port = value;
            self.io.hannes = 0xFF;
            self.memory.maps.update_all(|m| m | 0x0678);
            return;
        }
        self.io.hannes = value;
        let fill = if rs < 64 { 0x3C } else { 0x30 };
        let key = (((value | fill) & 0xCF) as u16) << 3;
        self.memory.maps.update_all(|m| (m & 0x7980) | key);
        log(LogCategory::Bus, LogLevel::Debug, || {
            format!("Hannes register 0x{:02X}", value)
        });
    }

    /// Events delayed by one half-cycle from the current phase.
    fn next_phase_events(&mut self) -> &mut DelayedEvents {
        if self.video.column & 0x01 == 0 {
            &mut self.video.odd_events
        } else {
            &mut self.video.even_events
        }
    }

    /// Events applied at the start of the next half-cycle of the same phase.
    fn same_phase_events(&mut self) -> &mut DelayedEvents {
        if self.video.column & 0x01 == 0 {
            &mut self.video.even_events
        } else {
            &mut self.video.odd_events
        }
    }

    fn write_register(&mut self, n: usize, value: u8) {
        self.io.data_bus = value;
        let old = self.regs[n];
        let timers = &mut self.timers;
        match n {
            0x00 => {
                timers.t1_run = false;
                timers.t1 = (timers.t1 & 0xFF00) | value as u16;
                timers.t1_reload = (timers.t1_reload & 0xFF00) | value as u16;
            }
            0x01 => {
                timers.t1_run = true;
                timers.t1 = (timers.t1 & 0x00FF) | (value as u16) << 8;
                timers.t1_reload = (timers.t1_reload & 0x00FF) | (value as u16) << 8;
            }
            0x02 => {
                timers.t2_run = false;
                self.video.even_events.cancel_timer2_start();
                self.timers.t2 = (self.timers.t2 & 0xFF00) | value as u16;
            }
            0x03 => {
                if !timers.t2_run {
                    if self.video.column & 0x01 == 0 {
                        timers.t2_run = true;
                    } else {
                        self.video.even_events.timer2_start();
                    }
                }
                self.timers.t2 = (self.timers.t2 & 0x00FF) | (value as u16) << 8;
            }
            0x04 => {
                timers.t3_run = false;
                timers.t3 = (timers.t3 & 0xFF00) | value as u16;
            }
            0x05 => {
                timers.t3_run = true;
                timers.t3 = (timers.t3 & 0x00FF) | (value as u16) << 8;
            }
            0x06 => self.write_ff06(old, value),
            0x07 => self.write_ff07(old, value),
            0x08 => {
                let mut mask = self.io.kbd_select & ((value as u16) << 8 | 0xFF);
                let mut state = 0xFF;
                for row in &self.io.keyboard[..11] {
                    if mask & 1 == 0 {
                        state &= row;
                    }
                    mask >>= 1;
                }
                self.regs[0x08] = state;
            }
            0x09 => {
                // writing 1 acknowledges; bit 2 always reads back set
                self.regs[0x09] = (old & !value) | 0x04;
                self.update_interrupt_flag();
            }
            0x0A => {
                self.regs[0x0A] = value;
                self.update_interrupt_flag();
                self.video.raster_compare =
                    (self.video.raster_compare & 0x00FF) | ((value & 0x01) as u16) << 8;
                self.check_raster_interrupt();
            }
            0x0B => {
                self.regs[0x0B] = value;
                self.video.raster_compare = (self.video.raster_compare & 0x0100) | value as u16;
                self.check_raster_interrupt();
            }
            0x0C => {
                self.regs[0x0C] = value;
                self.video.cursor = (self.video.cursor & 0x00FF) | ((value & 0x03) as u16) << 8;
            }
            0x0D => {
                self.regs[0x0D] = value;
                self.video.cursor = (self.video.cursor & 0x0300) | value as u16;
            }
            0x0E..=0x11 => {
                self.regs[n] = value;
                self.sound.write_register(0xFF00 | n as u16, value);
            }
            0x12 => {
                self.regs[0x12] = value;
                let maps = &mut self.memory.maps;
                maps.bitmap_read = (maps.bitmap_read & 0x7F78) | ((value & 0x04) as u16) << 5;
                self.video.bitmap_base = ((value & 0x38) as u16) << 10;
                self.sound.write_register(0xFF12, value);
            }
            0x13 => {
                if (value ^ old) & 0x02 != 0 {
                    self.video.even_events.force_single_clock();
                }
                self.regs[0x13] = value;
                self.update_video_mode();
            }
            0x14 => {
                self.regs[0x14] = value;
                self.video.dma_base = (self.video.dma_base & 0x0400) | ((value & 0xF8) as u16) << 8;
            }
            0x15..=0x19 => {
                self.regs[n] = value | 0x80;
                let i = n - 0x15;
                // the latch reads as white for the half-cycle before it settles
                self.video.colors[i] = 0xFF;
                self.next_phase_events().color(i);
            }
            0x1A | 0x1B => {
                self.regs[n] = value;
                self.video.char_pos_reload =
                    ((self.regs[0x1A] & 0x03) as u16) << 8 | self.regs[0x1B] as u16;
            }
            0x1C | 0x1D => {
                self.regs[n] = value;
                self.video.line = self.regs[0x1D] as u16 | ((self.regs[0x1C] & 0x01) as u16) << 8;
                self.check_dma_position_reset();
                self.check_raster_interrupt();
            }
            0x1E => {
                let column = (!value & 0xFC) >> 1;
                self.video.column = (self.video.column & 0x01) | column;
                self.regs[0x1E] = self.video.column;
            }
            0x1F => {
                // leaving flash count 15 inverts the flash state
                if (old ^ value) & 0x78 != 0 && old & 0x78 == 0x78 {
                    self.video.flash ^= 0xFF;
                }
                self.regs[0x1F] = value;
                self.video.sub_line = value & 0x07;
            }
            _ => self.regs[n] = value,
        }
    }

    fn write_ff06(&mut self, old: u8, value: u8) {
        let changed = old ^ value;
        self.regs[0x06] = value;
        let v = &mut self.video;
        v.mode = (v.mode & 0x09) | ((value >> 4) & 0x06);
        if changed & 0x07 != 0 {
            v.even_events.vertical_scroll();
        }
        if changed & 0x18 != 0 {
            match v.line_latch {
                0 => {
                    if value & 0x10 != 0 {
                        v.even_events.init_display();
                        v.even_events.vertical_scroll();
                    }
                }
                4 if value & 0x18 == 0x18 => v.display_window = true,
                8 if value & 0x18 == 0x10 => v.display_window = true,
                200 if value & 0x08 == 0 => v.display_window = false,
                204 if value & 0x08 != 0 => v.display_window = false,
                _ => {}
            }
        }
        if changed & 0x60 != 0 {
            self.update_video_mode();
            self.next_phase_events().select_renderer();
        }
    }

    fn write_ff07(&mut self, old: u8, value: u8) {
        let changed = old ^ value;
        self.regs[0x07] = value;
        self.video.frozen = value & 0x20 != 0;
        self.video.mode = (self.video.mode & 0x06) | ((value >> 4) & 0x09);
        if changed & 0x07 != 0 {
            self.same_phase_events().horizontal_scroll();
        }
        if changed & 0x20 != 0 && self.video.frozen && self.video.column & 0x01 == 0 {
            self.video.even_events.refresh_on();
            self.video.out_flags |= 0x20;
            self.video.renderer = Renderer::Blank;
        }
        if changed & 0x40 != 0 {
            self.set_ntsc(value & 0x40 != 0);
        }
        if changed & 0x90 != 0 {
            self.update_video_mode();
            self.next_phase_events().select_renderer();
        }
    }

    /// Switch between the PAL and NTSC timing of the single-clock cycle.
    fn set_ntsc(&mut self, ntsc: bool) {
        let timing = if ntsc {
            self.video.out_flags |= 0x01;
            self.video.cycle_len = 16;
            TimingMode::Ntsc
        } else {
            self.video.out_flags &= 0xFC;
            self.video.cycle_len = 20;
            TimingMode::Pal
        };
        self.sound.set_timing(timing);
        self.output.ntsc_mode_changed(ntsc);
        log(LogCategory::Video, LogLevel::Debug, || {
            format!("video standard: {:?} (line {})", timing, self.video.line)
        });
        if (226..=269).contains(&self.video.line_latch) {
            self.check_vertical_events();
        }
    }

    /// Press or release a key (0..=63) or joystick contact (72..=86); bit
    /// `key & 7` of matrix row `key >> 3`.
    pub fn set_key_state(&mut self, key: u8, pressed: bool) {
        let row = ((key & 0x78) >> 3) as usize;
        let mask = 1u8 << (key & 0x07);
        if pressed {
            self.io.keyboard[row] &= !mask;
        } else {
            self.io.keyboard[row] |= mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ted::tests::chip;

    #[test]
    fn test_open_bus_returns_last_driven_value() {
        let mut ted = chip();
        ted.write_bus(0x1234, 0x5A);
        let base = ted.memory.maps.read;
        assert_eq!(ted.read_bus(base, 0xFD05), 0x5A);
        // no ROM loaded at 8000
        assert_eq!(ted.read_bus(base, 0x8000), 0x5A);
        assert_eq!(ted.read_bus(base, 0x1234), 0x5A);
        ted.write_bus(0x2000, 0x11);
        assert_eq!(ted.read_bus(base, 0xFE80), 0x11);
        assert_eq!(ted.read_memory_cpu(0xFE80, false), 0xFF);
    }

    #[test]
    fn test_port_read_mixes_input_lines() {
        let mut ted = chip();
        let base = ted.memory.maps.read;
        assert_eq!(ted.read_bus(base, 0x0000), 0x0F);
        assert_eq!(ted.read_bus(base, 0x0001), 0xC8);
        ted.set_tape_input(true);
        assert_eq!(ted.read_bus(base, 0x0001), 0xD8);
        // the port does not drive the external bus
        assert_eq!(ted.io.data_bus, 0xFF);
    }

    #[test]
    fn test_irq_status_and_acknowledge() {
        let mut ted = chip();
        ted.regs[0x09] |= 0x0A;
        ted.write_bus(0xFF0A, 0x02);
        assert!(ted.io.irq);
        assert_eq!(ted.read_memory_cpu(0xFF09, false), 0xAF);
        ted.write_bus(0xFF09, 0x02);
        assert!(!ted.io.irq);
        assert_eq!(ted.regs[0x09], 0x0C);
        assert_eq!(ted.read_memory_cpu(0xFF0A, false), 0xA2);
    }

    #[test]
    fn test_raster_compare_fires_once() {
        let mut ted = chip();
        assert_eq!(ted.video.line, 224);
        ted.write_bus(0xFF0A, 0x02);
        ted.write_bus(0xFF0B, 0xE0);
        assert_eq!(ted.video.raster_compare, 224);
        assert!(ted.io.irq);
        ted.write_bus(0xFF09, 0x02);
        // same line again: the latch keeps it from firing twice
        ted.write_bus(0xFF0B, 0xE0);
        assert!(!ted.io.irq);
    }

    #[test]
    fn test_char_position_read_while_reload_pending() {
        let mut ted = chip();
        ted.regs[0x1A] = 0xFF;
        ted.regs[0x1B] = 0xFF;
        ted.video.char_pos_reload = 0x2A5;
        assert_eq!(ted.read_memory_cpu(0xFF1A, false), 0xFF);
        assert_eq!(ted.read_memory_cpu(0xFF1B, false), 0xFF);
        ted.video.odd_events.char_pos_registers();
        assert_eq!(ted.read_memory_cpu(0xFF1A, false), 0xFE);
        assert_eq!(ted.read_memory_cpu(0xFF1B, false), 0xA5);
    }

    #[test]
    fn test_sub_line_read_while_update_pending() {
        let mut ted = chip();
        ted.regs[0x1F] = 0x45;
        ted.video.sub_line = 2;
        assert_eq!(ted.read_memory_cpu(0xFF1F, false), 0xC5);
        ted.video.even_events.sub_line_register();
        assert_eq!(ted.read_memory_cpu(0xFF1F, false), 0xC0);
    }

    #[test]
    fn test_horizontal_position_write_is_inverted() {
        let mut ted = chip();
        ted.write_bus(0xFF1E, 0x00);
        assert_eq!(ted.video.column, 126);
        assert_eq!(ted.read_memory_cpu(0xFF1E, false), 252);
        ted.video.column = 7;
        ted.write_bus(0xFF1E, 0xFF);
        assert_eq!(ted.video.column, 1);
    }

    #[test]
    fn test_keyboard_matrix_rows() {
        let mut ted = chip();
        ted.set_key_state(0x0A, true);
        ted.write_bus(0xFD30, 0xFD);
        ted.write_bus(0xFF08, 0xFF);
        assert_eq!(ted.read_memory_cpu(0xFF08, false), 0xFB);
        ted.set_key_state(0x0A, false);
        ted.write_bus(0xFF08, 0xFF);
        assert_eq!(ted.regs[0x08], 0xFF);

        // joystick contacts are selected through the FF08 data byte
        ted.set_key_state(73, true);
        ted.write_bus(0xFD30, 0xFF);
        ted.write_bus(0xFF08, 0xFD);
        assert_eq!(ted.regs[0x08], 0xFD);
        assert_eq!(ted.read_memory_cpu(0xFD30, false), 0xFF);
    }

    #[test]
    fn test_timer_bytes_read_back() {
        let mut ted = chip();
        ted.write_bus(0xFF02, 0x34);
        ted.write_bus(0xFF03, 0x12);
        assert_eq!(ted.read_memory_cpu(0xFF02, false), 0x34);
        assert_eq!(ted.read_memory_cpu(0xFF03, false), 0x12);
        // timer writes leave the register copies alone
        assert_eq!(ted.regs[0x02], 0x00);
    }

    #[test]
    fn test_color_write_latched_next_phase() {
        let mut ted = chip();
        ted.video.column = 20;
        ted.write_bus(0xFF15, 0x32);
        assert_eq!(ted.regs[0x15], 0xB2);
        assert_eq!(ted.video.colors[0], 0xFF);
        assert!(ted.video.even_events.is_empty());
        let odd = ted.video.odd_events.take();
        ted.dispatch_events(odd);
        assert_eq!(ted.video.colors[0], 0xB2);
    }

    #[test]
    fn test_user_port_and_small_ram_fd16() {
        let mut ted = chip();
        ted.write_bus(0xFD16, 0x16);
        assert_eq!(ted.user_port(), 0x16);
        assert_eq!(ted.io.hannes, 0xFF);
        assert_eq!(ted.read_memory_cpu(0xFD16, false), 0x16);
        ted.set_tape_button_state(true);
        assert_eq!(ted.read_memory_cpu(0xFD10, false), 0x12);
    }

    #[test]
    fn test_hannes_bank_switch() {
        let mut ted = chip();
        ted.configure_ram(256, 0).expect("configure");
        ted.write_bus(0xFD16, 0x00);
        assert_eq!(ted.read_memory_cpu(0xFD16, false), 0x00);
        assert_eq!(ted.memory_page(0), 0xF0);
        assert_eq!(ted.memory_page(1), 0xF1);
        ted.write_bus(0x4000, 0x77);
        assert_eq!(ted.read_memory_raw(0xF1 << 14), 0x77);
        // user port only answers at FD10 with expansion RAM present
        ted.write_bus(0xFD11, 0x42);
        assert_eq!(ted.user_port(), 0xFF);

        ted.write_bus(0xFD16, 0xFF);
        assert_eq!(ted.memory_page(0), 0xFC);
        assert_eq!(ted.memory_page(1), 0xFD);
    }

    #[test]
    fn test_rom_bank_select_and_ram_switch() {
        let mut ted = chip();
        ted.load_rom(2, 0, Some(&[0xAB]));
        ted.write_bus(0x8000, 0x99);
        assert_eq!(ted.read_memory_cpu(0x8000, false), 0xFF);
        ted.write_bus(0xFDDA, 0x00);
        assert_eq!(ted.read_memory_cpu(0x8000, false), 0xAB);
        assert_eq!(ted.read_memory_cpu(0x8000, true), 0x99);
        assert_eq!(ted.read_memory_cpu(0xFF13, false) & 0x01, 0x01);
        ted.write_bus(0xFF3F, 0x00);
        assert_eq!(ted.read_memory_cpu(0x8000, false), 0x99);
        assert_eq!(ted.read_memory_cpu(0xFF13, false) & 0x01, 0x00);
        ted.write_bus(0xFF3E, 0x00);
        assert_eq!(ted.read_memory_cpu(0x8000, false), 0xAB);
    }

    #[test]
    fn test_video_mode_bits() {
        let mut ted = chip();
        ted.video.column = 10;
        ted.write_bus(0xFF06, 0x3B);
        assert_eq!(ted.video.mode, 0x02);
        assert!(ted.video.odd_events.contains(1 << 27));
        ted.write_bus(0xFF07, 0x98);
        assert_eq!(ted.video.mode, 0x0B);
        assert!(!ted.video.frozen);
    }

    #[test]
    fn test_ram_switch_reads_ff_with_ram_selected() {
        let mut ted = chip();
        ted.load_rom(0, 0x7F3E, Some(&[0x77]));
        ted.write_memory_raw((0xFF << 14) | 0x3F3E, 0x5A);
        let base = ted.memory.maps.cpu_read;
        assert_eq!(ted.read_bus(base, 0xFF3E), 0x77);

        ted.write_bus(0xFF3F, 0x00);
        let base = ted.memory.maps.cpu_read;
        assert_eq!(ted.read_bus(base, 0xFF3E), 0xFF);
        assert_eq!(ted.io.data_bus, 0xFF);
        assert_eq!(ted.read_memory_cpu(0xFF3F, false), 0xFF);
        assert_eq!(ted.read_memory_raw((0xFF << 14) | 0x3F3E), 0x5A);
        assert_eq!(ted.read_memory_cpu(0xFF3D, false), ted.read_memory_raw((0xFF << 14) | 0x3F3D));
    }
}
