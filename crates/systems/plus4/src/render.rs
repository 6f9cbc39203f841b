//! Pixel generation.
//!
//! Every half-cycle the selected renderer turns the video shift register
//! into four pixels and appends one record to the output buffer:
//!
//! - `flags` then one color byte when all four pixels share a color
//! - `flags | 0x02` then four color bytes otherwise
//!
//! Flags bits: 0x80 composite sync, 0x40 vertical sync, 0x20 horizontal
//! blanking, 0x10 vertical blanking, 0x08 burst, 0x04 PAL even line,
//! 0x02 four data bytes follow, 0x01 NTSC.
//!
//! The renderer is called with the number of pixels left until the next
//! character (the horizontal scroll, minus four in the odd phase). When it
//! falls in 0..=3 the shift register is reloaded from the freshly fetched
//! character part way through the group.

use crate::ted::TedChip;
use serde::{Deserialize, Serialize};

/// Flush threshold of the output buffer.
pub const FLUSH_THRESHOLD: usize = 450;
pub const OUTPUT_BUFFER_SIZE: usize = 464;

/// One character position worth of fetched video data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftRegister {
    pub attr: u8,
    pub chr: u8,
    pub bitmap: u8,
    /// Text modes only: bits 4-7 set at the cursor position, bit 3 set when
    /// reverse video is allowed.
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Renderer {
    #[default]
    CharStd,
    CharMulticolor,
    CharExtendedColor,
    BitmapHires,
    BitmapMulticolor,
    Blank,
    Border,
}

impl Renderer {
    /// Two bits per pixel for this character.
    fn is_multicolor(self, sr: &ShiftRegister) -> bool {
        match self {
            Renderer::BitmapMulticolor => true,
            Renderer::CharMulticolor => sr.attr & 0x08 != 0,
            _ => false,
        }
    }
}

impl TedChip {
    /// Pick the renderer for the current half-cycle: blanking and border
    /// override the configured video mode.
    pub(crate) fn select_render_function(&mut self) {
        let v = &mut self.video;
        v.renderer = if v.out_flags & 0xB0 != 0 {
            Renderer::Blank
        } else if !v.display_active {
            Renderer::Border
        } else {
            v.mode_renderer
        };
    }

    /// Recompute the character generator base and the character code mask
    /// after a mode or FF13 change.
    pub(crate) fn update_video_mode(&mut self) {
        let f13 = self.regs[0x13] as u16;
        let (base, mask) = match self.video.mode {
            0x00 | 0x01 => ((f13 & 0xFC) << 8, 0x7F),
            0x04 | 0x05 | 0x0C | 0x0D => ((f13 & 0xF8) << 8, 0x3F),
            0x08 | 0x09 => ((f13 & 0xF8) << 8, 0xFF),
            _ => (0, 0),
        };
        self.video.charset_base = base;
        self.video.char_mask = mask;
    }

    pub(crate) fn render(&mut self, n: i32) {
        match self.video.renderer {
            Renderer::Blank => self.render_blank(n),
            Renderer::Border => self.render_border(n),
            mode => self.render_display(mode, n),
        }
    }

    fn render_display(&mut self, mode: Renderer, n: i32) {
        let split = if (0..4).contains(&n) { n as usize } else { 4 };
        let parity = (n & 1) as usize;
        let flash = self.video.flash;
        let old = self.video.shifter;
        let old_bits = display_bits(mode, &old, old.bitmap, flash);

        let mut new = self.video.fetched;
        let mut new_bits = 0;
        if split < 4 {
            let consumed = (4 - split) as u32;
            let mut b = new.bitmap;
            if mode == Renderer::CharStd && new.attr & 0x80 != 0 {
                b &= (new.flags & 0xF0) | (new.flags >> 4) | flash;
            }
            new_bits = display_bits(mode, &new, b, flash);
            new.bitmap = if mode.is_multicolor(&new) {
                b << (consumed & 6)
            } else {
                b << consumed
            };
            self.video.shifter = new;
        } else {
            self.video.shifter.bitmap <<= 4;
        }

        let mut pixels = [0u8; 4];
        for (j, px) in pixels.iter_mut().enumerate() {
            *px = if j < split {
                self.pixel_color(mode, &old, old_bits, j, parity, j > 0)
            } else {
                self.pixel_color(mode, &new, new_bits, j - split, 0, j > 0)
            };
        }

        let v = &mut self.video;
        let pos = v.out_pos;
        v.out_prev_pos = pos;
        v.out_buf[pos] = v.out_flags | 0x02;
        v.out_buf[pos + 1..pos + 5].copy_from_slice(&pixels);
        v.out_pos = pos + 5;
    }

    /// Color of pixel `i` of the run taken from `sr`; `live` selects the
    /// background registers as written rather than as latched for the
    /// first pixel of the group.
    fn pixel_color(
        &self,
        mode: Renderer,
        sr: &ShiftRegister,
        bits: u8,
        i: usize,
        parity: usize,
        live: bool,
    ) -> u8 {
        let bg = |k: usize| {
            if live {
                self.regs[0x15 + k]
            } else {
                self.video.colors[k]
            }
        };
        let (a, c) = (sr.attr, sr.chr);
        let lum_hue = ((a & 0x07) << 4) | (c >> 4);
        let hue_lum = (a & 0x70) | (c & 0x0F);
        if mode.is_multicolor(sr) {
            let shift = 6 - 2 * ((i + parity) / 2);
            let palette = if mode == Renderer::BitmapMulticolor {
                [bg(0), lum_hue, hue_lum, bg(1)]
            } else {
                [bg(0), bg(1), bg(2), a & 0x77]
            };
            return palette[((bits >> shift) & 3) as usize];
        }
        let set = (bits << i) & 0x80 != 0;
        match mode {
            Renderer::BitmapHires => {
                if set {
                    lum_hue
                } else {
                    hue_lum
                }
            }
            Renderer::CharExtendedColor => {
                if set {
                    a
                } else {
                    bg((c >> 6) as usize)
                }
            }
            _ => {
                if set {
                    a
                } else {
                    bg(0)
                }
            }
        }
    }

    /// Shift register update shared by the blank and border renderers.
    fn shift_idle(&mut self, n: i32) {
        let v = &mut self.video;
        if (0..4).contains(&n) {
            v.shifter = v.fetched;
            let b = v.shifter.bitmap;
            if b != 0 {
                let consumed = (4 - n) as u32;
                let hires =
                    v.mode & 0x01 == 0 || (v.mode & 0x03 == 0x01 && v.shifter.attr & 0x08 == 0);
                v.shifter.bitmap = if hires {
                    b << consumed
                } else {
                    b << (consumed & 6)
                };
            }
        } else {
            v.shifter.bitmap <<= 4;
        }
    }

    pub(crate) fn render_blank(&mut self, n: i32) {
        let v = &mut self.video;
        let pos = v.out_pos;
        v.out_prev_pos = pos;
        v.out_buf[pos] = v.out_flags;
        v.out_buf[pos + 1] = 0x00;
        v.out_pos = pos + 2;
        self.shift_idle(n);
    }

    fn render_border(&mut self, n: i32) {
        self.shift_idle(n);
        let border = self.regs[0x19];
        let v = &mut self.video;
        let pos = v.out_pos;
        v.out_prev_pos = pos;
        if v.colors[4] != border {
            v.out_buf[pos] = v.out_flags | 0x02;
            v.out_buf[pos + 1] = v.colors[4];
            v.out_buf[pos + 2..pos + 5].fill(border);
            v.out_pos = pos + 5;
        } else {
            v.out_buf[pos] = v.out_flags;
            v.out_buf[pos + 1] = v.colors[4];
            v.out_pos = pos + 2;
        }
    }

    /// Hand the buffered records to the output sink once the buffer is
    /// nearly full. Called between cycles, so records are never split.
    pub(crate) fn flush_video_output(&mut self) {
        if self.video.out_pos >= FLUSH_THRESHOLD {
            self.output
                .video_output(&self.video.out_buf[..self.video.out_pos]);
            self.video.out_pos = 0;
        }
    }

    /// The record emitted by the most recent render call.
    pub fn last_video_record(&self) -> &[u8] {
        let pos = self.video.out_prev_pos;
        let len = if self.video.out_buf[pos] & 0x02 != 0 { 5 } else { 2 };
        &self.video.out_buf[pos..pos + len]
    }
}

/// Bitmap as displayed: text mode applies reverse video and the cursor.
fn display_bits(mode: Renderer, sr: &ShiftRegister, bitmap: u8, flash: u8) -> u8 {
    if mode != Renderer::CharStd {
        return bitmap;
    }
    let reverse = if sr.chr & (sr.flags << 4) & 0x80 != 0 {
        0xFF
    } else {
        0x00
    };
    bitmap ^ reverse ^ (sr.flags & flash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ted::tests::chip;

    fn display(renderer: Renderer) -> TedChip {
        let mut ted = chip();
        ted.video.out_flags = 0x00;
        ted.video.mode_renderer = renderer;
        ted.video.display_active = true;
        ted.select_render_function();
        ted
    }

    #[test]
    fn test_hires_bitmap_reload() {
        let mut ted = display(Renderer::BitmapHires);
        ted.video.fetched = ShiftRegister {
            attr: 0x12,
            chr: 0x34,
            bitmap: 0xA0,
            flags: 0,
        };
        ted.render(0);
        assert_eq!(ted.last_video_record(), &[0x02, 0x23, 0x14, 0x23, 0x14]);
        assert_eq!(ted.video.shifter.bitmap, 0x00);
        assert_eq!(ted.video.out_pos, 5);
    }

    #[test]
    fn test_multicolor_bitmap_mid_group_reload() {
        let mut ted = display(Renderer::BitmapMulticolor);
        ted.video.colors[0] = 0x11;
        ted.video.colors[1] = 0x22;
        ted.regs[0x15] = 0x33;
        ted.regs[0x16] = 0x44;
        ted.video.shifter = ShiftRegister {
            attr: 0x00,
            chr: 0x00,
            bitmap: 0xC0,
            flags: 0,
        };
        ted.video.fetched = ShiftRegister {
            attr: 0x35,
            chr: 0x9C,
            bitmap: 0x60,
            flags: 0,
        };
        ted.render(1);
        assert_eq!(ted.last_video_record(), &[0x02, 0x22, 0x59, 0x59, 0x3C]);
        assert_eq!(ted.video.shifter.bitmap, 0x80);
        assert_eq!(ted.video.shifter.attr, 0x35);
    }

    #[test]
    fn test_multicolor_text_odd_offset_without_reload() {
        let mut ted = display(Renderer::CharMulticolor);
        ted.video.colors = [0x01, 0x02, 0x03, 0x04, 0x05];
        ted.regs[0x15] = 0x21;
        ted.regs[0x16] = 0x22;
        ted.regs[0x17] = 0x23;
        ted.video.shifter = ShiftRegister {
            attr: 0x0B,
            chr: 0x00,
            bitmap: 0x1B,
            flags: 0,
        };
        ted.render(5);
        assert_eq!(ted.last_video_record(), &[0x02, 0x01, 0x22, 0x22, 0x23]);
        assert_eq!(ted.video.shifter.bitmap, 0xB0);
    }

    #[test]
    fn test_reverse_text_uses_live_background_after_first_pixel() {
        let mut ted = display(Renderer::CharStd);
        ted.video.colors[0] = 0x05;
        ted.regs[0x15] = 0x06;
        ted.video.flash = 0;
        ted.video.fetched = ShiftRegister {
            attr: 0x71,
            chr: 0x81,
            bitmap: 0xF0,
            flags: 0x0F,
        };
        ted.render(0);
        assert_eq!(ted.last_video_record(), &[0x02, 0x05, 0x06, 0x06, 0x06]);

        // same character with reverse video disabled (FF07 bit 7)
        ted.video.fetched.flags = 0x07;
        ted.render(0);
        assert_eq!(ted.last_video_record(), &[0x02, 0x71, 0x71, 0x71, 0x71]);
    }

    #[test]
    fn test_flashing_text_hidden_when_flash_off() {
        let mut ted = display(Renderer::CharStd);
        ted.video.colors[0] = 0x00;
        ted.regs[0x15] = 0x00;
        ted.video.flash = 0x00;
        ted.video.fetched = ShiftRegister {
            attr: 0xF1,
            chr: 0x01,
            bitmap: 0xFF,
            flags: 0x0F,
        };
        ted.render(0);
        assert_eq!(ted.last_video_record(), &[0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(ted.video.shifter.bitmap, 0x00);
    }

    #[test]
    fn test_extended_color_background() {
        let mut ted = display(Renderer::CharExtendedColor);
        ted.video.colors = [0x10, 0x11, 0x12, 0x13, 0x14];
        ted.regs[0x15..0x19].copy_from_slice(&[0x20, 0x21, 0x22, 0x23]);
        ted.video.fetched = ShiftRegister {
            attr: 0x47,
            chr: 0xC5,
            bitmap: 0x50,
            flags: 0,
        };
        ted.render(0);
        assert_eq!(ted.last_video_record(), &[0x02, 0x13, 0x47, 0x23, 0x47]);
    }

    #[test]
    fn test_border_records() {
        let mut ted = chip();
        ted.video.out_flags = 0x00;
        ted.video.display_active = false;
        ted.select_render_function();
        assert_eq!(ted.video.renderer, Renderer::Border);

        ted.video.colors[4] = 0x6E;
        ted.regs[0x19] = 0x6E;
        ted.render(6);
        assert_eq!(ted.last_video_record(), &[0x00, 0x6E]);

        ted.regs[0x19] = 0x32;
        ted.render(6);
        assert_eq!(ted.last_video_record(), &[0x02, 0x6E, 0x32, 0x32, 0x32]);
        assert_eq!(ted.video.out_pos, 7);
    }

    #[test]
    fn test_blanking_overrides_mode() {
        let mut ted = display(Renderer::CharStd);
        ted.video.out_flags = 0x20;
        ted.select_render_function();
        assert_eq!(ted.video.renderer, Renderer::Blank);
        ted.video.fetched.bitmap = 0x81;
        ted.video.mode = 0x00;
        ted.render(1);
        assert_eq!(ted.last_video_record(), &[0x20, 0x00]);
        assert_eq!(ted.video.shifter.bitmap, 0x08);
    }

    #[test]
    fn test_video_mode_charset_base() {
        let mut ted = chip();
        ted.regs[0x13] = 0xD7;
        ted.video.mode = 0x00;
        ted.update_video_mode();
        assert_eq!(ted.video.charset_base, 0xD400);
        assert_eq!(ted.video.char_mask, 0x7F);
        ted.video.mode = 0x0C;
        ted.update_video_mode();
        assert_eq!(ted.video.charset_base, 0xD000);
        assert_eq!(ted.video.char_mask, 0x3F);
        ted.video.mode = 0x02;
        ted.update_video_mode();
        assert_eq!((ted.video.charset_base, ted.video.char_mask), (0, 0));
    }
}
