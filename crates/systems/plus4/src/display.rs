//! Frame assembly and the TED color palette.
//!
//! The chip emits four pixels per half-cycle as compact records (see
//! [`crate::render`]). [`FrameBuilder`] walks that stream, starts a new
//! line on every rising edge of horizontal blanking and completes the
//! frame on every rising edge of vertical sync.

use crate::ted::TedOutput;
use emu_core::apu::TimingMode;
use emu_core::types::Frame;
use std::cell::RefCell;
use std::rc::Rc;

pub const FRAME_WIDTH: u32 = 456;

const FLAG_VSYNC: u8 = 0x40;
const FLAG_HBLANK: u8 = 0x20;
const FLAG_BLANK: u8 = 0x30;
const FLAG_FOUR_PIXELS: u8 = 0x02;
const FLAG_NTSC: u8 = 0x01;

const BRIGHTNESS_TO_Y: [f32; 9] = [2.00, 2.42, 2.60, 2.70, 2.90, 3.35, 3.75, 4.10, 4.80];

/// Hue phase angles in degrees.
const PHASE_PAL: [f32; 16] = [
    0.0, 0.0, 103.0, 283.0, 53.0, 240.0, 347.0, 167.0, 130.0, 148.0, 195.0, 83.0, 265.0, 323.0,
    3.0, 213.0,
];
const PHASE_NTSC: [f32; 16] = [
    0.0, 0.0, 103.0, 283.0, 53.0, 240.0, 347.0, 167.0, 125.0, 148.0, 195.0, 83.0, 265.0, 323.0,
    23.0, 213.0,
];

/// Y, U and V of a TED color byte: bits 0-3 hue (0 is black at any
/// luminance), bits 4-6 luminance.
pub fn convert_pixel_to_yuv(color: u8, ntsc: bool) -> (f32, f32, f32) {
    const Y_MIN: f32 = 0.033;
    const Y_MAX: f32 = 0.956;
    let hue = (color & 0x0F) as usize;
    let lum = ((color & 0x70) >> 4) as usize;
    let level = if hue != 0 { lum + 1 } else { 0 };
    let span = BRIGHTNESS_TO_Y[8] - BRIGHTNESS_TO_Y[0];
    let y = (BRIGHTNESS_TO_Y[level] - BRIGHTNESS_TO_Y[0]) * (Y_MAX - Y_MIN) / span + Y_MIN;
    if hue <= 1 {
        return (y, 0.0, 0.0);
    }
    let phase = if ntsc { PHASE_NTSC[hue] } else { PHASE_PAL[hue] }.to_radians();
    (y, phase.cos() * 0.19, phase.sin() * 0.19)
}

/// `0x00RRGGBB` from Y, U and V (0.0..=1.0 luminance).
pub fn yuv_to_rgb(y: f32, u: f32, v: f32) -> u32 {
    let r = y + v / 0.877;
    let g = y - u * (0.114 / (0.492 * 0.587)) - v * (0.299 / (0.877 * 0.587));
    let b = y + u / 0.492;
    let byte = |x: f32| (x * 255.0 + 0.5).clamp(0.0, 255.0) as u32;
    (byte(r) << 16) | (byte(g) << 8) | byte(b)
}

/// RGB values for the 128 TED colors.
#[derive(Debug, Clone)]
pub struct Palette {
    colors: [u32; 128],
}

impl Palette {
    pub fn new(ntsc: bool) -> Self {
        let mut colors = [0; 128];
        for (c, rgb) in colors.iter_mut().enumerate() {
            let (y, u, v) = convert_pixel_to_yuv(c as u8, ntsc);
            *rgb = yuv_to_rgb(y, u, v);
        }
        Self { colors }
    }

    pub fn rgb(&self, color: u8) -> u32 {
        self.colors[(color & 0x7F) as usize]
    }
}

/// Builds frames out of the video record stream.
pub struct FrameBuilder {
    pal: Palette,
    ntsc: Palette,
    frame: Frame,
    completed: Option<Frame>,
    x: u32,
    y: u32,
    prev_flags: u8,
    frame_count: u64,
}

impl FrameBuilder {
    pub fn new(timing: TimingMode) -> Self {
        Self {
            pal: Palette::new(false),
            ntsc: Palette::new(true),
            frame: Frame::new(FRAME_WIDTH, timing.lines_per_frame()),
            completed: None,
            x: 0,
            y: 0,
            prev_flags: 0,
            frame_count: 0,
        }
    }

    /// Frames completed since creation.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Switch the output size; the frame in progress restarts.
    pub fn set_timing(&mut self, timing: TimingMode) {
        if self.frame.height != timing.lines_per_frame() {
            self.frame = Frame::new(FRAME_WIDTH, timing.lines_per_frame());
            self.x = 0;
            self.y = 0;
        }
    }

    /// Append complete records. A trailing partial record is ignored.
    pub fn push(&mut self, records: &[u8]) {
        let mut pos = 0;
        while pos < records.len() {
            let flags = records[pos];
            let len = if flags & FLAG_FOUR_PIXELS != 0 { 5 } else { 2 };
            let Some(data) = records.get(pos + 1..pos + len) else {
                break;
            };
            pos += len;

            let rising = flags & !self.prev_flags;
            self.prev_flags = flags;
            if rising & FLAG_VSYNC != 0 {
                self.finish_frame();
            } else if rising & FLAG_HBLANK != 0 {
                self.x = 0;
                self.y += 1;
            }

            let palette = if flags & FLAG_NTSC != 0 {
                &self.ntsc
            } else {
                &self.pal
            };
            for i in 0..4 {
                let rgb = if flags & FLAG_BLANK != 0 {
                    0
                } else {
                    palette.rgb(data[if len == 5 { i } else { 0 }])
                };
                self.frame.put(self.x + i as u32, self.y, rgb);
            }
            self.x += 4;
        }
    }

    fn finish_frame(&mut self) {
        let next = Frame::new(self.frame.width, self.frame.height);
        self.completed = Some(std::mem::replace(&mut self.frame, next));
        self.frame_count += 1;
        self.x = 0;
        self.y = 0;
    }

    /// The most recently completed frame, if one finished since the last
    /// call.
    pub fn take_completed(&mut self) -> Option<Frame> {
        self.completed.take()
    }

    /// The frame currently being drawn.
    pub fn current(&self) -> &Frame {
        &self.frame
    }
}

/// A [`TedOutput`] feeding a shared [`FrameBuilder`] and sample queue.
#[derive(Clone)]
pub struct FrameCollector {
    pub frames: Rc<RefCell<FrameBuilder>>,
    pub samples: Rc<RefCell<Vec<i16>>>,
}

impl FrameCollector {
    pub fn new(timing: TimingMode) -> Self {
        Self {
            frames: Rc::new(RefCell::new(FrameBuilder::new(timing))),
            samples: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl TedOutput for FrameCollector {
    fn video_output(&mut self, records: &[u8]) {
        self.frames.borrow_mut().push(records);
    }

    fn ntsc_mode_changed(&mut self, ntsc: bool) {
        let timing = if ntsc { TimingMode::Ntsc } else { TimingMode::Pal };
        self.frames.borrow_mut().set_timing(timing);
    }

    fn play_sample(&mut self, sample: i16) {
        self.samples.borrow_mut().push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(rgb: u32) -> (u32, u32, u32) {
        (rgb >> 16, (rgb >> 8) & 0xFF, rgb & 0xFF)
    }

    #[test]
    fn test_black_ignores_luminance() {
        let p = Palette::new(false);
        assert_eq!(p.rgb(0x00), p.rgb(0x70));
        assert_eq!(channels(p.rgb(0x00)), (8, 8, 8));
        // bit 7 is not part of the color
        assert_eq!(p.rgb(0x80), p.rgb(0x00));
    }

    #[test]
    fn test_grey_ramp() {
        let p = Palette::new(false);
        let (r, g, b) = channels(p.rgb(0x71));
        assert_eq!((r, g), (b, b));
        assert_eq!(r, 244);
        let greys: Vec<u32> = (0..8u8).map(|lum| channels(p.rgb(lum << 4 | 1)).0).collect();
        assert!(greys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(greys[0], 44);
    }

    #[test]
    fn test_red_hue() {
        let (y, u, v) = convert_pixel_to_yuv(0x32, false);
        assert!(u < 0.0 && v > 0.0);
        let (r, g, b) = channels(yuv_to_rgb(y, u, v));
        assert!(r > g && r > b);
    }

    #[test]
    fn test_ntsc_phase_differs_only_where_expected() {
        for hue in 0..16u8 {
            let a = convert_pixel_to_yuv(0x40 | hue, false);
            let b = convert_pixel_to_yuv(0x40 | hue, true);
            assert_eq!(a == b, hue != 8 && hue != 14, "hue {}", hue);
        }
    }

    #[test]
    fn test_builder_lines_and_frames() {
        let mut fb = FrameBuilder::new(TimingMode::Pal);
        let white = Palette::new(false).rgb(0x71);
        // two solid records on line 0, then an hblank edge starts line 1
        fb.push(&[0x00, 0x71, 0x02, 0x71, 0x00, 0x71, 0x00]);
        assert_eq!(fb.current().pixels[0], white);
        assert_eq!(fb.current().pixels[4], white);
        assert_eq!(fb.current().pixels[5], 0x080808);
        fb.push(&[0x20, 0x00, 0x00, 0x71]);
        let w = FRAME_WIDTH as usize;
        // blanking pixels are black, the line restarted at x = 4 after the
        // blank record
        assert_eq!(fb.current().pixels[w], 0);
        assert_eq!(fb.current().pixels[w + 4], white);
        assert!(fb.take_completed().is_none());

        fb.push(&[0x50, 0x00, 0x00, 0x71]);
        let done = fb.take_completed().expect("frame");
        assert_eq!((done.width, done.height), (456, 312));
        assert_eq!(done.pixels[w + 4], white);
        assert_eq!(fb.frame_count(), 1);
        assert_eq!(fb.current().pixels[4], white);
        assert!(fb.take_completed().is_none());
    }

    #[test]
    fn test_builder_ignores_partial_record() {
        let mut fb = FrameBuilder::new(TimingMode::Ntsc);
        fb.push(&[0x03, 0x71, 0x71]);
        assert!(fb.current().pixels.iter().all(|&p| p == 0));
        assert_eq!(fb.current().height, 262);
    }

    #[test]
    fn test_collector_switches_frame_size() {
        let mut out = FrameCollector::new(TimingMode::Pal);
        out.ntsc_mode_changed(true);
        out.play_sample(-5);
        assert_eq!(out.frames.borrow().current().height, 262);
        assert_eq!(*out.samples.borrow(), vec![-5]);
    }
}
