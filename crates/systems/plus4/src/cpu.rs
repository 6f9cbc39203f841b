//! Interface between the TED and the attached 7501/8501 CPU core.
//!
//! The CPU core itself lives outside this crate. The chip drives it one bus
//! cycle at a time and hands it a [`CpuBus`] for the memory accesses it
//! makes during that cycle.

/// Memory seen by the CPU, decoded by the TED.
pub trait CpuBus {
    fn read_memory(&mut self, addr: u16) -> u8;
    fn write_memory(&mut self, addr: u16, value: u8);
}

/// A CPU core that can be stepped by the TED.
pub trait TedCpu {
    /// Run one half-cycle with RDY high; `multiplier` is the number of CPU
    /// cycles to execute per half-cycle (1..=100).
    fn run_rdy_high(&mut self, bus: &mut dyn CpuBus, multiplier: i32);

    /// Run one half-cycle with RDY low: only write cycles may complete.
    fn run_rdy_low(&mut self, bus: &mut dyn CpuBus, multiplier: i32);

    /// The chip halts the CPU for the duration of a DMA transfer.
    fn set_is_cpu_running(&mut self, running: bool);

    /// Level-triggered IRQ input.
    fn interrupt_request(&mut self, asserted: bool);

    fn reset(&mut self, cold: bool);
}

/// A CPU that never accesses the bus. Useful for running the video and
/// sound side of the chip on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleCpu;

impl TedCpu for IdleCpu {
    fn run_rdy_high(&mut self, _bus: &mut dyn CpuBus, _multiplier: i32) {}

    fn run_rdy_low(&mut self, _bus: &mut dyn CpuBus, _multiplier: i32) {}

    fn set_is_cpu_running(&mut self, _running: bool) {}

    fn interrupt_request(&mut self, _asserted: bool) {}

    fn reset(&mut self, _cold: bool) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CpuEvent {
        High,
        Low,
        Running(bool),
        Irq(bool),
        Reset(bool),
    }

    /// Scripted CPU: records every call and, on each RDY-high step, performs
    /// the next queued bus operation.
    #[derive(Clone, Default)]
    pub struct ScriptedCpu {
        pub events: Rc<RefCell<Vec<CpuEvent>>>,
        pub script: Rc<RefCell<Vec<BusOp>>>,
        pub reads: Rc<RefCell<Vec<(u16, u8)>>>,
    }

    #[derive(Debug, Clone, Copy)]
    pub enum BusOp {
        Read(u16),
        Write(u16, u8),
    }

    impl ScriptedCpu {
        pub fn queue(&self, op: BusOp) {
            self.script.borrow_mut().push(op);
        }

        pub fn count(&self, event: &CpuEvent) -> usize {
            self.events.borrow().iter().filter(|e| *e == event).count()
        }
    }

    impl TedCpu for ScriptedCpu {
        fn run_rdy_high(&mut self, bus: &mut dyn CpuBus, _multiplier: i32) {
            self.events.borrow_mut().push(CpuEvent::High);
            let op = {
                let mut script = self.script.borrow_mut();
                if script.is_empty() {
                    None
                } else {
                    Some(script.remove(0))
                }
            };
            match op {
                Some(BusOp::Read(addr)) => {
                    let v = bus.read_memory(addr);
                    self.reads.borrow_mut().push((addr, v));
                }
                Some(BusOp::Write(addr, v)) => bus.write_memory(addr, v),
                None => {}
            }
        }

        fn run_rdy_low(&mut self, _bus: &mut dyn CpuBus, _multiplier: i32) {
            self.events.borrow_mut().push(CpuEvent::Low);
        }

        fn set_is_cpu_running(&mut self, running: bool) {
            self.events.borrow_mut().push(CpuEvent::Running(running));
        }

        fn interrupt_request(&mut self, asserted: bool) {
            self.events.borrow_mut().push(CpuEvent::Irq(asserted));
        }

        fn reset(&mut self, cold: bool) {
            self.events.borrow_mut().push(CpuEvent::Reset(cold));
        }
    }
}
