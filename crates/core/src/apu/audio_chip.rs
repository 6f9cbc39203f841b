//! Audio chip trait for pluggable audio implementations.

use super::TimingMode;

/// A sound generator that can be driven register by register and clocked
/// one output sample at a time.
pub trait AudioChip {
    /// Write to a register on the audio chip
    fn write_register(&mut self, addr: u16, val: u8);

    /// Read from a register on the audio chip (if supported)
    fn read_register(&self, addr: u16) -> u8 {
        let _ = addr;
        0
    }

    /// Advance the generator by one tick and return the new sample
    fn clock(&mut self) -> i16;

    fn timing(&self) -> TimingMode;

    fn generate_samples(&mut self, count: usize) -> Vec<i16> {
        (0..count).map(|_| self.clock()).collect()
    }

    /// Reset the chip to power-on state
    fn reset(&mut self);

    /// Native sample rate of this chip (in Hz)
    fn sample_rate(&self) -> f64 {
        self.timing().cpu_clock_hz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: i16,
    }

    impl AudioChip for Counter {
        fn write_register(&mut self, _addr: u16, val: u8) {
            self.value = val as i16;
        }

        fn clock(&mut self) -> i16 {
            self.value += 1;
            self.value
        }

        fn timing(&self) -> TimingMode {
            TimingMode::Pal
        }

        fn reset(&mut self) {
            self.value = 0;
        }
    }

    #[test]
    fn test_default_methods() {
        let mut chip = Counter { value: 0 };
        chip.write_register(0, 10);
        assert_eq!(chip.read_register(0), 0);
        assert_eq!(chip.generate_samples(3), vec![11, 12, 13]);
        assert_eq!(chip.sample_rate(), TimingMode::Pal.cpu_clock_hz());
        chip.reset();
        assert_eq!(chip.clock(), 1);
    }
}
