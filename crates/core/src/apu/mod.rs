//! Audio chip interface and region timing shared by the emulated systems.

pub mod audio_chip;
pub mod timing;

pub use audio_chip::AudioChip;
pub use timing::TimingMode;
