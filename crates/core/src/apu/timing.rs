//! Video standard timing for the emulated machines.

use serde::{Deserialize, Serialize};

/// Console region timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimingMode {
    /// NTSC: 14.31818 MHz master clock, 262 lines
    Ntsc,
    /// PAL: 17.734475 MHz master clock, 312 lines
    #[default]
    Pal,
}

impl TimingMode {
    /// Crystal frequency feeding the video chip
    pub fn master_clock_hz(&self) -> f64 {
        match self {
            TimingMode::Ntsc => 14_318_180.0,
            TimingMode::Pal => 17_734_475.0,
        }
    }

    /// Master clock periods per single-clock CPU cycle
    pub fn master_clocks_per_cycle(&self) -> u32 {
        match self {
            TimingMode::Ntsc => 16,
            TimingMode::Pal => 20,
        }
    }

    /// Single-clock CPU frequency in Hz
    pub fn cpu_clock_hz(&self) -> f64 {
        self.master_clock_hz() / self.master_clocks_per_cycle() as f64
    }

    pub fn lines_per_frame(&self) -> u32 {
        match self {
            TimingMode::Ntsc => 262,
            TimingMode::Pal => 312,
        }
    }

    /// Frame rate in Hz, 57 single-clock cycles per line
    pub fn frame_rate_hz(&self) -> f64 {
        self.cpu_clock_hz() / (57.0 * self.lines_per_frame() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_clock() {
        assert!((TimingMode::Pal.cpu_clock_hz() - 886_723.75).abs() < 0.01);
        assert!((TimingMode::Ntsc.cpu_clock_hz() - 894_886.25).abs() < 0.01);
    }

    #[test]
    fn test_frame_rate() {
        assert!((TimingMode::Pal.frame_rate_hz() - 49.86).abs() < 0.01);
        assert!((TimingMode::Ntsc.frame_rate_hz() - 59.92).abs() < 0.01);
    }
}
