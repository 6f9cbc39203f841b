use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emu_plus4::cpu::{CpuBus, IdleCpu, TedCpu};
use emu_plus4::ted::Ted7360;

/// Fetches from the bus every step so the CPU path of the decoder is
/// exercised alongside DMA.
struct BusyCpu {
    pc: u16,
    acc: u8,
}

impl TedCpu for BusyCpu {
    fn run_rdy_high(&mut self, bus: &mut dyn CpuBus, _multiplier: i32) {
        self.acc = self.acc.wrapping_add(bus.read_memory(self.pc));
        self.pc = 0x1000 | (self.pc.wrapping_add(1) & 0x0FFF);
    }

    fn run_rdy_low(&mut self, _bus: &mut dyn CpuBus, _multiplier: i32) {}

    fn set_is_cpu_running(&mut self, _running: bool) {}

    fn interrupt_request(&mut self, _asserted: bool) {}

    fn reset(&mut self, _cold: bool) {
        self.pc = 0x1000;
    }
}

fn text_mode<C: TedCpu>(cpu: C) -> Ted7360<C> {
    let mut ted = Ted7360::new(cpu);
    ted.configure_ram(64, 0).expect("configure");
    ted.reset(true);
    ted.chip_mut().write_bus(0xFF06, 0x1B);
    ted
}

fn bench_ted_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("ted_frame");
    const PAL_FRAME: i32 = 57 * 312 * 20;

    group.bench_function("idle_cpu", |b| {
        let mut ted = text_mode(IdleCpu);
        b.iter(|| black_box(ted.run(PAL_FRAME).expect("run")));
    });

    group.bench_function("busy_cpu", |b| {
        let mut ted = text_mode(BusyCpu {
            pc: 0x1000,
            acc: 0,
        });
        b.iter(|| {
            ted.run(PAL_FRAME).expect("run");
            black_box(ted.cpu.acc);
        });
    });

    group.finish();
}

fn bench_ted_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("ted_video_mode");

    for (name, ff06, ff07) in [
        ("text", 0x1B, 0x08),
        ("multicolor_text", 0x1B, 0x18),
        ("hires_bitmap", 0x3B, 0x08),
        ("multicolor_bitmap", 0x3B, 0x18),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &(ff06, ff07), |b, &(f6, f7)| {
            let mut ted = text_mode(IdleCpu);
            ted.chip_mut().write_bus(0xFF06, f6);
            ted.chip_mut().write_bus(0xFF07, f7);
            b.iter(|| black_box(ted.run(57 * 20 * 8).expect("run")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ted_frame, bench_ted_modes);
criterion_main!(benches);
