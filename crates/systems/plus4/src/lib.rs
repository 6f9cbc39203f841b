//! Commodore Plus/4 TED7360 core.
//!
//! The TED is the Plus/4's video, timer, sound and memory controller chip.
//! This crate emulates it cycle by cycle and drives an external CPU core
//! through the [`cpu::TedCpu`] trait.

use emu_core::apu::TimingMode;
use emu_core::logging::{LogConfig, LogLevel};
use emu_core::{types::Frame, MountPointInfo, System};
use serde::{Deserialize, Serialize};

pub mod cpu;
pub mod display;
pub mod events;
pub mod memory;
pub mod registers;
pub mod render;
pub mod snapshot;
pub mod sound;
pub mod ted;

use cpu::TedCpu;
use display::FrameCollector;
use snapshot::Snapshot;
use ted::Ted7360;

#[derive(thiserror::Error, Debug)]
pub enum TedError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Too many phase callbacks")]
    TooManyCallbacks,
    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Largest image accepted by a ROM bank.
const ROM_BANK_SIZE: usize = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plus4Config {
    pub ram_size_kib: u32,
    /// 48-bit RAM fill pattern code.
    pub ram_pattern: u64,
    pub ntsc: bool,
    pub cpu_clock_multiplier: i32,
    pub log_level: Option<String>,
}

impl Default for Plus4Config {
    fn default() -> Self {
        Self {
            ram_size_kib: 64,
            ram_pattern: 0,
            ntsc: false,
            cpu_clock_multiplier: 1,
            log_level: None,
        }
    }
}

impl Plus4Config {
    pub fn from_json(s: &str) -> Result<Self, TedError> {
        Ok(serde_json::from_str(s)?)
    }

    fn timing(&self) -> TimingMode {
        if self.ntsc {
            TimingMode::Ntsc
        } else {
            TimingMode::Pal
        }
    }
}

pub struct Plus4System<C: TedCpu> {
    ted: Ted7360<C>,
    output: FrameCollector,
    config: Plus4Config,
    mounted: [bool; 4],
}

impl<C: TedCpu> Plus4System<C> {
    pub fn new(cpu: C) -> Result<Self, TedError> {
        Self::with_config(cpu, &Plus4Config::default())
    }

    pub fn with_config(cpu: C, config: &Plus4Config) -> Result<Self, TedError> {
        if let Some(name) = &config.log_level {
            let level = LogLevel::from_str(name)
                .ok_or_else(|| TedError::InvalidArgument(format!("unknown log level: {}", name)))?;
            LogConfig::global().set_global_level(level);
        }

        let output = FrameCollector::new(config.timing());
        let mut ted = Ted7360::new(cpu);
        ted.chip_mut().set_output(Box::new(output.clone()));
        ted.configure_ram(config.ram_size_kib, config.ram_pattern)?;
        ted.set_cpu_clock_multiplier(config.cpu_clock_multiplier);

        let mut sys = Self {
            ted,
            output,
            config: config.clone(),
            mounted: [false; 4],
        };
        sys.reset();
        Ok(sys)
    }

    pub fn ted(&self) -> &Ted7360<C> {
        &self.ted
    }

    pub fn ted_mut(&mut self) -> &mut Ted7360<C> {
        &mut self.ted
    }

    pub fn config(&self) -> &Plus4Config {
        &self.config
    }

    pub fn set_key_state(&mut self, key: u8, pressed: bool) {
        self.ted.set_key_state(key, pressed);
    }

    /// Samples produced since the last call.
    pub fn take_audio_samples(&mut self) -> Vec<i16> {
        std::mem::take(&mut *self.output.samples.borrow_mut())
    }

    /// Input clock ticks in one frame at the current video standard.
    fn ticks_per_frame(&self) -> i32 {
        let timing = if self.ted.chip().is_ntsc() {
            TimingMode::Ntsc
        } else {
            TimingMode::Pal
        };
        (57 * timing.lines_per_frame() * timing.master_clocks_per_cycle()) as i32
    }

    /// The NTSC bit lives in FF07, which a cold reset clears.
    fn apply_video_standard(&mut self) {
        if self.config.ntsc {
            let chip = self.ted.chip_mut();
            let f07 = chip.regs[0x07];
            chip.write_bus(0xFF07, f07 | 0x40);
        }
    }

    fn rom_bank(mount_point_id: &str) -> Result<u8, TedError> {
        match mount_point_id {
            "rom0" => Ok(0),
            "rom1" => Ok(1),
            "rom2" => Ok(2),
            "rom3" => Ok(3),
            _ => Err(TedError::InvalidMountPoint(mount_point_id.to_string())),
        }
    }
}

impl<C: TedCpu> System for Plus4System<C> {
    type Error = TedError;

    fn reset(&mut self) {
        self.ted.reset(true);
        self.apply_video_standard();
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        let ticks = self.ticks_per_frame();
        self.ted.run(ticks)?;
        let mut frames = self.output.frames.borrow_mut();
        Ok(match frames.take_completed() {
            Some(frame) => frame,
            None => frames.current().clone(),
        })
    }

    fn save_state(&self) -> serde_json::Value {
        serde_json::json!({
            "system": "plus4",
            "version": 1,
            "ted": serde_json::to_value(self.ted.save_state()).unwrap_or_default(),
        })
    }

    fn load_state(&mut self, v: &serde_json::Value) -> Result<(), serde_json::Error> {
        use serde::de::Error as _;

        if v.get("system").and_then(|s| s.as_str()) != Some("plus4") {
            return Err(serde_json::Error::custom("not a Plus/4 save state"));
        }
        let ted = v
            .get("ted")
            .ok_or_else(|| serde_json::Error::custom("missing TED state"))?;
        let snapshot: Snapshot = serde_json::from_value(ted.clone())?;
        self.ted.load_state(snapshot).map_err(|e| match e {
            TedError::Snapshot(e) => e,
            e => serde_json::Error::custom(e.to_string()),
        })
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        let names = [
            "BASIC + KERNAL ROM",
            "3-plus-1 ROM",
            "Cartridge 1",
            "Cartridge 2",
        ];
        names
            .iter()
            .enumerate()
            .map(|(i, name)| MountPointInfo {
                id: format!("rom{}", i),
                name: name.to_string(),
                extensions: vec!["rom".to_string(), "bin".to_string()],
                required: i == 0,
            })
            .collect()
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        let bank = Self::rom_bank(mount_point_id)?;
        if data.is_empty() || data.len() > ROM_BANK_SIZE {
            return Err(TedError::InvalidArgument(format!(
                "ROM image for {} has {} bytes",
                mount_point_id,
                data.len()
            )));
        }
        self.ted.load_rom(bank, 0, None);
        self.ted.load_rom(bank, 0x4000, None);
        self.ted.load_rom(bank, 0, Some(data));
        self.mounted[bank as usize] = true;
        self.reset();
        Ok(())
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        let bank = Self::rom_bank(mount_point_id)?;
        self.ted.load_rom(bank, 0, None);
        self.ted.load_rom(bank, 0x4000, None);
        self.mounted[bank as usize] = false;
        Ok(())
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        Self::rom_bank(mount_point_id).is_ok_and(|bank| self.mounted[bank as usize])
    }
}
