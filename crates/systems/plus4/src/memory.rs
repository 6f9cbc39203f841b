//! Segmented ROM/RAM storage and the bank-switching lookup table.
//!
//! The Plus/4 address space is backed by up to 256 segments of 16 KiB.
//! Segments 0x00-0x07 hold the four 32 KiB ROM banks, RAM occupies the top
//! of the table (0xFF downwards, one segment per 16 KiB). Which segment
//! answers an address is decided by an 8-slot row of the map table; the row
//! is selected by a 12-bit configuration key:
//!
//! | bits  | meaning                                    |
//! |-------|--------------------------------------------|
//! | 0-3   | Hannes RAM bank                            |
//! | 4     | ROM enabled at 8000-FFFF                   |
//! | 5     | access made by the video chip              |
//! | 6     | video chip follows the Hannes bank         |
//! | 7     | Hannes bank not applied below 4000         |
//! | 8-9   | ROM bank at 8000-BFFF                      |
//! | 10-11 | ROM bank at C000-FFFF                      |
//!
//! Row slots: 0 = 1000-3FFF, 1 = 4000-7FFF, 2 = 8000-BFFF, 3 = C000-FBFF,
//! 4 = 0000-0FFF, 5 = FC00-FCFF, 6 = FD00-FEFF, 7 = FF00-FFFF.

use crate::TedError;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

pub const SEGMENT_SIZE: usize = 0x4000;
const SEGMENT_COUNT: usize = 256;
const MAP_TABLE_SIZE: usize = 4096 * 8;

/// Segment index that is never populated (FD00-FEFF reads as open bus).
const ABSENT_SEGMENT: u8 = 0x7F;

/// Row slot used by the video chip's bitmap fetch, per 4 KiB page.
const BITMAP_SLOT: [usize; 16] = [4, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];

/// The four independent paths through the bank-switching logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    CpuRead,
    CpuWrite,
    DmaRead,
    BitmapRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    None,
    Rom,
    Ram,
}

/// Map table row bases (`key << 3`) for each access path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSelect {
    /// Row used by `read_memory`, normally equal to `cpu_read`.
    pub read: u16,
    pub cpu_read: u16,
    pub write: u16,
    pub dma_read: u16,
    pub bitmap_read: u16,
}

impl Default for MapSelect {
    fn default() -> Self {
        Self {
            read: 0x06F8,
            cpu_read: 0x06F8,
            write: 0x0678,
            dma_read: 0x07F8,
            bitmap_read: 0x07F8,
        }
    }
}

impl MapSelect {
    /// Apply `f` to every row base, the write row included.
    pub fn update_all(&mut self, f: impl Fn(u16) -> u16) {
        self.read = f(self.read);
        self.cpu_read = f(self.cpu_read);
        self.write = f(self.write);
        self.dma_read = f(self.dma_read);
        self.bitmap_read = f(self.bitmap_read);
    }

    /// First row base that is not a multiple of 8 or lies past the table.
    fn invalid_row(&self) -> Option<(&'static str, u16)> {
        [
            ("read", self.read),
            ("cpu_read", self.cpu_read),
            ("write", self.write),
            ("dma_read", self.dma_read),
            ("bitmap_read", self.bitmap_read),
        ]
        .into_iter()
        .find(|&(_, base)| base & 7 != 0 || base as usize > MAP_TABLE_SIZE - 8)
    }

    /// Apply `f` to the read paths that follow the ROM bank select.
    pub fn update_reads(&mut self, f: impl Fn(u16) -> u16) {
        self.read = f(self.read);
        self.cpu_read = f(self.cpu_read);
        self.dma_read = f(self.dma_read);
        self.bitmap_read = f(self.bitmap_read);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    segments: Vec<Option<Vec<u8>>>,
    #[serde(skip, default = "empty_map_table")]
    map_table: Vec<u8>,
    ram_segments: u8,
    ram_pattern: u64,
    random_seed: u32,
    pub maps: MapSelect,
}

fn empty_map_table() -> Vec<u8> {
    vec![0xFF; MAP_TABLE_SIZE]
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    /// An unconfigured memory: no RAM, no ROM, every slot absent.
    pub fn new() -> Self {
        Self {
            segments: vec![None; SEGMENT_COUNT],
            map_table: empty_map_table(),
            ram_segments: 0,
            ram_pattern: 0,
            random_seed: 0,
            maps: MapSelect::default(),
        }
    }

    pub fn ram_segments(&self) -> u8 {
        self.ram_segments
    }

    pub fn ram_pattern(&self) -> u64 {
        self.ram_pattern
    }

    /// Resize RAM to the largest supported size not above `size_kib`
    /// (16, 32, 64, 256 or 1024 KiB) and fill it from `pattern`.
    ///
    /// On allocation failure nothing is changed.
    pub fn configure_ram(&mut self, size_kib: u32, pattern: u64) -> Result<(), TedError> {
        let size_kib = match size_kib {
            k if k >= 1024 => 1024,
            k if k >= 256 => 256,
            k if k >= 64 => 64,
            k if k >= 32 => 32,
            _ => 16,
        };
        let ram_segments = (size_kib >> 4) as u8;
        let first_ram = SEGMENT_COUNT - ram_segments as usize;

        let mut fresh = Vec::new();
        for seg in first_ram..SEGMENT_COUNT {
            if self.segments[seg].is_none() {
                let mut buf: Vec<u8> = Vec::new();
                buf.try_reserve_exact(SEGMENT_SIZE).map_err(|e| {
                    TedError::Configuration(format!(
                        "cannot allocate RAM segment 0x{:02X}: {}",
                        seg, e
                    ))
                })?;
                buf.resize(SEGMENT_SIZE, 0);
                fresh.push((seg, buf));
            }
        }

        self.ram_segments = ram_segments;
        self.ram_pattern = pattern & ((1u64 << 48) - 1);
        for seg in &mut self.segments[0x08..first_ram] {
            *seg = None;
        }
        for (seg, buf) in fresh {
            self.segments[seg] = Some(buf);
        }

        self.set_random_seed((self.ram_pattern as u32) ^ ((self.ram_pattern >> 32) as u32));
        for seg in (first_ram..SEGMENT_COUNT).rev() {
            let mut buf = self.segments[seg].take().unwrap_or_default();
            buf.resize(SEGMENT_SIZE, 0);
            self.fill_ram_segment(&mut buf);
            self.segments[seg] = Some(buf);
        }
        self.rebuild_map_table();

        log(LogCategory::Memory, LogLevel::Info, || {
            format!(
                "RAM configured: {} KiB, pattern 0x{:012X}",
                size_kib, self.ram_pattern
            )
        });
        Ok(())
    }

    /// Fill a RAM segment with the power-on pattern: a base table derived
    /// from address line permutations, mixed with pseudo-random bytes.
    fn fill_ram_segment(&mut self, buf: &mut [u8]) {
        let mut code = self.ram_pattern;
        let mut bit_masks = [0u8; 8];
        let mut xor_value = 0u8;
        for (i, mask) in bit_masks.iter_mut().enumerate() {
            *mask = 1 << (code & 7);
            xor_value |= (((code & 8) >> 3) as u8) << i;
            code >>= 4;
        }
        let mut base = [0u8; 256];
        for (i, b) in base.iter_mut().enumerate() {
            let mut n = xor_value;
            for (j, &mask) in bit_masks.iter().enumerate() {
                if i & mask as usize != 0 {
                    n ^= 1 << j;
                }
            }
            *b = n;
        }
        base[0] ^= (code & 0xFF) as u8;
        let threshold = (code & 0xFF00) as u32;
        for (i, b) in buf.iter_mut().enumerate() {
            let rnd = self.next_random() & 0xFFFF;
            *b = if threshold <= rnd {
                base[i & 0xFF]
            } else {
                rnd as u8
            };
        }
    }

    fn set_random_seed(&mut self, seed: u32) {
        let mut n = seed;
        while n >= 0x7FFF_FFFF {
            n -= 0x7FFF_FFFE;
        }
        if n == 0 {
            n = 0x7FFF_FFFE;
        }
        self.random_seed = n;
        self.next_random();
    }

    /// Park-Miller minimal standard generator (multiplier 742938285).
    fn next_random(&mut self) -> u32 {
        let product = self.random_seed as u64 * 742_938_285;
        let mut n = (product & 0x7FFF_FFFF) as u32 + (product >> 31) as u32;
        if n >= 0x8000_0000 {
            n -= 0x7FFF_FFFF;
        }
        self.random_seed = n;
        n
    }

    pub fn rebuild_map_table(&mut self) {
        let rs = self.ram_segments;
        if self.map_table.len() != MAP_TABLE_SIZE {
            self.map_table = empty_map_table();
        }
        for key in 0..4096usize {
            let row = &mut self.map_table[key << 3..(key << 3) + 8];
            let bank = (key & 0x0F) as u8;
            let is_rom = key & 0x10 != 0;
            let is_ted = key & 0x20 != 0;
            let ted_follows_hannes = key & 0x40 != 0;
            let hannes_below_4000 = key & 0x80 == 0;
            let rom_low = ((key >> 8) & 3) as u8;
            let rom_high = ((key >> 10) & 3) as u8;
            for (j, slot) in row.iter_mut().take(4).enumerate() {
                let seg = (bank << 2) + j as u8;
                *slot = if is_rom && j == 2 {
                    (rom_low << 1) | (seg & 1)
                } else if is_rom && j == 3 {
                    (rom_high << 1) | (seg & 1)
                } else if rs < 2 {
                    0xFF
                } else if rs < 4 {
                    0xFE | seg
                } else if rs < 16 || (is_ted && !ted_follows_hannes) {
                    0xFC | seg
                } else if rs < 64 {
                    0xF0 | seg
                } else {
                    0xC0 | seg
                };
            }
            row[4] = if rs >= 4 {
                0xFC
            } else if rs >= 2 {
                0xFE
            } else {
                0xFF
            };
            if !hannes_below_4000 {
                row[0] = row[4];
            }
            row[5] = if is_rom { 0x01 } else { row[3] };
            row[6] = ABSENT_SEGMENT;
            row[7] = row[3];
        }
    }

    /// Copy `data` into the ROM bank starting at `offset`; `None` deletes
    /// the segment `offset` falls into.
    pub fn load_rom(&mut self, bank: u8, offset: usize, data: Option<&[u8]>) {
        let segment_of = |i: usize| (((bank & 3) << 1) as usize) + ((i & 0x4000) >> 14);
        match data {
            Some(bytes) => {
                for (j, &b) in bytes.iter().enumerate() {
                    let i = offset + j;
                    let seg = self.segments[segment_of(i)]
                        .get_or_insert_with(|| vec![0xFF; SEGMENT_SIZE]);
                    seg[i & 0x3FFF] = b;
                }
                log(LogCategory::Memory, LogLevel::Info, || {
                    format!(
                        "ROM bank {} loaded: {} bytes at offset 0x{:04X}",
                        bank & 3,
                        bytes.len(),
                        offset
                    )
                });
            }
            None => {
                let seg = segment_of(offset);
                if self.segments[seg].take().is_some() {
                    log(LogCategory::Memory, LogLevel::Info, || {
                        format!("ROM segment 0x{:02X} unloaded", seg)
                    });
                }
            }
        }
    }

    pub fn segment_kind(&self, n: u8) -> SegmentKind {
        match self.segments[n as usize] {
            None => SegmentKind::None,
            Some(_) if n < 0x80 => SegmentKind::Rom,
            Some(_) => SegmentKind::Ram,
        }
    }

    /// Segment mapped at CPU page `n` (0 = 0000-3FFF .. 3 = C000-FFFF).
    pub fn memory_page(&self, n: u8) -> u8 {
        self.map_table[self.maps.cpu_read as usize + (n & 3) as usize]
    }

    /// Segment number and offset backing `addr` on the given path, or
    /// `None` for open bus.
    pub fn resolve(&self, kind: AccessKind, addr: u16) -> Option<(u8, usize)> {
        let (base, slot) = match kind {
            AccessKind::CpuRead => (self.maps.read, cpu_slot(addr)),
            AccessKind::DmaRead => (self.maps.dma_read, cpu_slot(addr)),
            AccessKind::CpuWrite => (
                self.maps.write,
                if (0xFC00..0xFD00).contains(&addr) {
                    3
                } else {
                    cpu_slot(addr)
                },
            ),
            AccessKind::BitmapRead => (self.maps.bitmap_read, BITMAP_SLOT[(addr >> 12) as usize]),
        };
        self.resolve_slot(base, slot, addr)
    }

    /// Look up slot `slot` of the row at `base` directly.
    pub fn resolve_slot(&self, base: u16, slot: usize, addr: u16) -> Option<(u8, usize)> {
        let seg = self.map_table[base as usize + slot];
        self.segments[seg as usize]
            .as_ref()
            .map(|_| (seg, (addr & 0x3FFF) as usize))
    }

    pub fn read(&self, kind: AccessKind, addr: u16) -> Option<u8> {
        self.resolve(kind, addr)
            .map(|(seg, off)| self.segment_byte(seg, off))
    }

    pub fn read_slot(&self, base: u16, slot: usize, addr: u16) -> Option<u8> {
        self.resolve_slot(base, slot, addr)
            .map(|(seg, off)| self.segment_byte(seg, off))
    }

    /// Read through an arbitrary row with the CPU slot layout.
    pub fn read_mapped(&self, base: u16, addr: u16) -> Option<u8> {
        self.read_slot(base, cpu_slot(addr), addr)
    }

    /// Store through the CPU write path; returns false on open bus.
    pub fn write(&mut self, addr: u16, value: u8) -> bool {
        match self.resolve(AccessKind::CpuWrite, addr) {
            Some((seg, off)) => {
                if let Some(buf) = self.segments[seg as usize].as_mut() {
                    buf[off] = value;
                }
                true
            }
            None => false,
        }
    }

    fn segment_byte(&self, seg: u8, off: usize) -> u8 {
        self.segments[seg as usize]
            .as_ref()
            .map_or(0xFF, |buf| buf[off])
    }

    /// Read a 22-bit physical address (segment << 14 | offset).
    pub fn read_raw(&self, addr: u32) -> u8 {
        self.segment_byte(((addr >> 14) & 0xFF) as u8, (addr & 0x3FFF) as usize)
    }

    /// Write a 22-bit physical address; ROM segments 0x00-0x07 are ignored.
    pub fn write_raw(&mut self, addr: u32, value: u8) {
        let seg = ((addr >> 14) & 0xFF) as usize;
        if seg >= 0x08 {
            if let Some(buf) = self.segments[seg].as_mut() {
                buf[(addr & 0x3FFF) as usize] = value;
            }
        }
    }

    pub(crate) fn segment_mut(&mut self, n: u8) -> Option<&mut Vec<u8>> {
        self.segments[n as usize].as_mut()
    }

    /// Check a deserialized memory image and rebuild the derived table.
    pub(crate) fn validate_and_rebuild(&mut self) -> Result<(), TedError> {
        if !matches!(self.ram_segments, 1 | 2 | 4 | 16 | 64) {
            return Err(TedError::InvalidArgument(format!(
                "invalid RAM segment count: {}",
                self.ram_segments
            )));
        }
        if self.segments.len() != SEGMENT_COUNT {
            return Err(TedError::InvalidArgument(format!(
                "segment table has {} entries",
                self.segments.len()
            )));
        }
        if let Some(n) = self
            .segments
            .iter()
            .position(|s| s.as_ref().is_some_and(|b| b.len() != SEGMENT_SIZE))
        {
            return Err(TedError::InvalidArgument(format!(
                "segment 0x{:02X} is truncated",
                n
            )));
        }
        if let Some((name, base)) = self.maps.invalid_row() {
            return Err(TedError::InvalidArgument(format!(
                "invalid {} map row 0x{:04X}",
                name, base
            )));
        }
        self.rebuild_map_table();
        Ok(())
    }
}

/// Row slot answering a CPU or DMA read at `addr`.
fn cpu_slot(addr: u16) -> usize {
    match addr {
        0x0000..=0x0FFF => 4,
        0x1000..=0x3FFF => 0,
        0x4000..=0x7FFF => 1,
        0x8000..=0xBFFF => 2,
        0xC000..=0xFBFF => 3,
        0xFC00..=0xFCFF => 5,
        0xFD00..=0xFEFF => 6,
        _ => 7,
    }
}
