//! Chip snapshots.
//!
//! A snapshot is an ordered list of named chunks. Loading checks the chunk
//! order and every size the stepping engine indexes with, so a restored
//! chip never panics and continues exactly where the saved one stopped.

use crate::cpu::TedCpu;
use crate::memory::Memory;
use crate::render::OUTPUT_BUFFER_SIZE;
use crate::sound::TedSound;
use crate::ted::{IoState, Ted7360, TedChip, Timers, VideoState};
use crate::TedError;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Chunk {
    Memory(Memory),
    Io(IoState),
    Registers(Vec<u8>),
    Video(VideoState),
    Sound(TedSound),
    Timers(Timers),
}

impl Chunk {
    fn name(&self) -> &'static str {
        match self {
            Chunk::Memory(_) => "Memory",
            Chunk::Io(_) => "Io",
            Chunk::Registers(_) => "Registers",
            Chunk::Video(_) => "Video",
            Chunk::Sound(_) => "Sound",
            Chunk::Timers(_) => "Timers",
        }
    }
}

const CHUNK_ORDER: [&str; 6] = ["Memory", "Io", "Registers", "Video", "Sound", "Timers"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub chunks: Vec<Chunk>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, TedError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, TedError> {
        Ok(serde_json::from_str(s)?)
    }
}

fn invalid(msg: impl Into<String>) -> TedError {
    TedError::InvalidArgument(msg.into())
}

fn check_video(v: &VideoState) -> Result<(), TedError> {
    for (name, buf) in [
        ("attr_buf", &v.attr_buf),
        ("attr_fetch", &v.attr_fetch),
        ("char_buf", &v.char_buf),
    ] {
        if buf.len() != 64 {
            return Err(invalid(format!("{} has {} bytes", name, buf.len())));
        }
    }
    if v.out_buf.len() != OUTPUT_BUFFER_SIZE {
        return Err(invalid(format!("output buffer has {} bytes", v.out_buf.len())));
    }
    if v.out_pos > OUTPUT_BUFFER_SIZE - 5 || v.out_prev_pos > OUTPUT_BUFFER_SIZE - 5 {
        return Err(invalid(format!("output position {} out of range", v.out_pos)));
    }
    if v.fetch_column >= 64 {
        return Err(invalid(format!("fetch column {} out of range", v.fetch_column)));
    }
    if v.column >= 114 {
        return Err(invalid(format!("column {} out of range", v.column)));
    }
    if !matches!(v.cycle_len, 16 | 20) || v.cycle_carry > 0 {
        return Err(invalid(format!(
            "invalid cycle length {} / carry {}",
            v.cycle_len, v.cycle_carry
        )));
    }
    Ok(())
}

impl TedChip {
    pub fn snapshot(&self) -> Snapshot {
        log(LogCategory::Memory, LogLevel::Info, || {
            format!(
                "saving snapshot ({} RAM segments)",
                self.memory.ram_segments()
            )
        });
        Snapshot {
            version: SNAPSHOT_VERSION,
            chunks: vec![
                Chunk::Memory(self.memory.clone()),
                Chunk::Io(self.io.clone()),
                Chunk::Registers(self.regs.to_vec()),
                Chunk::Video(self.video.clone()),
                Chunk::Sound(self.sound.clone()),
                Chunk::Timers(self.timers),
            ],
        }
    }

    /// Replace the chip state with `snapshot`. On error the chip is left
    /// unchanged.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), TedError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(invalid(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let names: Vec<&str> = snapshot.chunks.iter().map(Chunk::name).collect();
        if names != CHUNK_ORDER {
            return Err(invalid(format!("unexpected chunk order: {:?}", names)));
        }

        let mut memory = None;
        let mut io = None;
        let mut regs = None;
        let mut video = None;
        let mut sound = None;
        let mut timers = None;
        for chunk in snapshot.chunks {
            match chunk {
                Chunk::Memory(m) => memory = Some(m),
                Chunk::Io(i) => io = Some(i),
                Chunk::Registers(r) => regs = Some(r),
                Chunk::Video(v) => video = Some(v),
                Chunk::Sound(s) => sound = Some(s),
                Chunk::Timers(t) => timers = Some(t),
            }
        }
        let (
            Some(mut memory),
            Some(io),
            Some(regs),
            Some(video),
            Some(sound),
            Some(timers),
        ) = (memory, io, regs, video, sound, timers)
        else {
            return Err(invalid("missing chunk"));
        };

        let regs: [u8; 32] = regs
            .try_into()
            .map_err(|r: Vec<u8>| invalid(format!("register chunk has {} bytes", r.len())))?;
        memory.validate_and_rebuild()?;
        check_video(&video)?;
        sound.validate()?;

        let was_ntsc = self.is_ntsc();
        self.memory = memory;
        self.io = io;
        self.regs = regs;
        self.video = video;
        self.sound = sound;
        self.timers = timers;
        if self.is_ntsc() != was_ntsc {
            let ntsc = self.is_ntsc();
            self.output.ntsc_mode_changed(ntsc);
        }
        log(LogCategory::Memory, LogLevel::Info, || {
            format!(
                "snapshot restored ({} RAM segments, {})",
                self.memory.ram_segments(),
                if self.is_ntsc() { "NTSC" } else { "PAL" }
            )
        });
        Ok(())
    }
}

impl<C: TedCpu> Ted7360<C> {
    pub fn save_state(&self) -> Snapshot {
        self.chip().snapshot()
    }

    /// Restore the chip and tell the CPU the current RDY and IRQ levels.
    pub fn load_state(&mut self, snapshot: Snapshot) -> Result<(), TedError> {
        self.chip_mut().restore(snapshot)?;
        self.resync_cpu();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::IdleCpu;
    use crate::ted::tests::{chip, Recorder};

    fn running_machine() -> (Ted7360<IdleCpu>, Recorder) {
        let rec = Recorder::default();
        let mut chip = chip();
        chip.set_output(Box::new(rec.clone()));
        let mut ted = Ted7360::with_chip(IdleCpu, chip);
        // text mode with the display enabled and a few colors set
        ted.chip_mut().write_bus(0xFF06, 0x1B);
        ted.chip_mut().write_bus(0xFF15, 0x71);
        ted.chip_mut().write_bus(0xFF19, 0x32);
        ted.run(7 * 20_000 + 13).expect("run");
        (ted, rec)
    }

    #[test]
    fn test_snapshot_round_trip_continues_identically() {
        let (mut original, rec_a) = running_machine();
        let json = original.save_state().to_json().expect("serialize");

        let rec_b = Recorder::default();
        let mut chip = TedChip::new();
        chip.set_output(Box::new(rec_b.clone()));
        let mut restored = Ted7360::with_chip(IdleCpu, chip);
        restored
            .load_state(Snapshot::from_json(&json).expect("parse"))
            .expect("restore");
        assert_eq!(restored.chip().regs, original.chip().regs);
        assert_eq!(restored.chip().video, original.chip().video);

        rec_a.video.borrow_mut().clear();
        rec_a.samples.borrow_mut().clear();
        let budget = 312 * 114 * 20;
        assert_eq!(
            original.run(budget).expect("run"),
            restored.run(budget).expect("run")
        );
        assert_eq!(*rec_a.video.borrow(), *rec_b.video.borrow());
        assert_eq!(*rec_a.samples.borrow(), *rec_b.samples.borrow());
        assert_eq!(restored.chip().video, original.chip().video);
        assert_eq!(restored.chip().timers, original.chip().timers);
        for addr in (0xFC_u32 << 14)..(0x100 << 14) {
            assert_eq!(
                restored.chip().read_memory_raw(addr),
                original.chip().read_memory_raw(addr)
            );
        }
    }

    #[test]
    fn test_wrong_chunk_order_rejected() {
        let chip = chip();
        let mut snap = chip.snapshot();
        snap.chunks.swap(1, 2);
        let mut target = TedChip::new();
        let before = target.regs;
        assert!(matches!(
            target.restore(snap),
            Err(TedError::InvalidArgument(_))
        ));
        assert_eq!(target.regs, before);
    }

    #[test]
    fn test_invalid_ram_size_rejected() {
        let chip = chip();
        let mut value = serde_json::to_value(chip.snapshot()).expect("serialize");
        value["chunks"][0]["data"]["ram_segments"] = serde_json::json!(8);
        let snap: Snapshot = serde_json::from_value(value).expect("parse");
        let mut target = TedChip::new();
        assert!(matches!(
            target.restore(snap),
            Err(TedError::InvalidArgument(_))
        ));
    }

    /// Apply `edit` to a fresh snapshot and check that restoring it fails
    /// and leaves the target untouched.
    fn assert_rejected(edit: impl FnOnce(&mut Snapshot)) {
        let mut snap = chip().snapshot();
        edit(&mut snap);
        let mut target = chip();
        let before = target.video.clone();
        assert!(matches!(
            target.restore(snap),
            Err(TedError::InvalidArgument(_))
        ));
        assert_eq!(target.video, before);
    }

    fn edit_video(f: impl FnOnce(&mut VideoState)) -> impl FnOnce(&mut Snapshot) {
        move |snap: &mut Snapshot| {
            if let Chunk::Video(v) = &mut snap.chunks[3] {
                f(v);
            }
        }
    }

    fn edit_sound(f: impl FnOnce(&mut TedSound)) -> impl FnOnce(&mut Snapshot) {
        move |snap: &mut Snapshot| {
            if let Chunk::Sound(s) = &mut snap.chunks[4] {
                f(s);
            }
        }
    }

    fn edit_memory(f: impl FnOnce(&mut Memory)) -> impl FnOnce(&mut Snapshot) {
        move |snap: &mut Snapshot| {
            if let Chunk::Memory(m) = &mut snap.chunks[0] {
                f(m);
            }
        }
    }

    #[test]
    fn test_video_fields_out_of_range_rejected() {
        assert_rejected(edit_video(|v| v.out_pos = OUTPUT_BUFFER_SIZE - 4));
        assert_rejected(edit_video(|v| v.out_prev_pos = OUTPUT_BUFFER_SIZE));
        assert_rejected(edit_video(|v| v.out_buf.truncate(100)));
        assert_rejected(edit_video(|v| v.attr_buf.push(0)));
        assert_rejected(edit_video(|v| v.fetch_column = 64));
        assert_rejected(edit_video(|v| v.column = 114));
        assert_rejected(edit_video(|v| v.cycle_len = 18));
        assert_rejected(edit_video(|v| v.cycle_carry = 1));
    }

    #[test]
    fn test_memory_fields_out_of_range_rejected() {
        assert_rejected(edit_memory(|m| m.maps.dma_read = 0xFFF8));
        assert_rejected(edit_memory(|m| m.maps.cpu_read = 0x06F9));
        assert_rejected(edit_memory(|m| {
            if let Some(buf) = m.segment_mut(0xFF) {
                buf.pop();
            }
        }));
    }

    #[test]
    fn test_sound_fields_out_of_range_rejected() {
        assert_rejected(edit_sound(|s| s.flags = 0xB8));
        assert_rejected(edit_sound(|s| s.volume = 200));
        assert_rejected(edit_sound(|s| s.output = 151));
        assert_rejected(edit_sound(|s| s.prev_output = 255));
    }

    #[test]
    fn test_rejected_map_row_never_reaches_the_engine() {
        let mut snap = chip().snapshot();
        edit_memory(|m| m.maps.dma_read = 0xFFF8)(&mut snap);
        let mut ted = Ted7360::with_chip(IdleCpu, chip());
        assert!(ted.load_state(snap).is_err());
        ted.run(57 * 8 * 20).expect("run");
    }

    #[test]
    fn test_short_register_chunk_rejected() {
        let chip = chip();
        let mut snap = chip.snapshot();
        snap.chunks[2] = Chunk::Registers(vec![0; 31]);
        let mut target = TedChip::new();
        assert!(target.restore(snap).is_err());
    }

    #[test]
    fn test_garbage_json_is_a_snapshot_error() {
        assert!(matches!(
            Snapshot::from_json("{\"version\": 1"),
            Err(TedError::Snapshot(_))
        ));
    }
}
