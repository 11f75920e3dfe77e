use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emu_core::host_display::HeadlessDisplay;
use emu_psx::gpu_hw::{PrimitiveFlags, Vertex};
use emu_psx::{GpuHw, GpuSettings, SoftwareBackend};

fn gpu(resolution_scale: u32) -> GpuHw<SoftwareBackend> {
    let settings = GpuSettings { resolution_scale, ..Default::default() };
    GpuHw::new(SoftwareBackend::new(), &mut HeadlessDisplay::new(), &settings).expect("gpu")
}

fn bench_cpu_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("vram_transfers");
    let data: Vec<u16> = (0..64 * 64).map(|i| i as u16 & 0x7FFF).collect();

    for scale in [1u32, 2] {
        group.bench_with_input(BenchmarkId::new("write_64x64", scale), &scale, |b, &scale| {
            let mut gpu = gpu(scale);
            b.iter(|| {
                gpu.update_vram(128, 128, 64, 64, black_box(&data), false, false).expect("write");
            });
        });

        group.bench_with_input(BenchmarkId::new("fill_256x256", scale), &scale, |b, &scale| {
            let mut gpu = gpu(scale);
            b.iter(|| gpu.fill_vram(0, 0, 256, 256, black_box(0x1234)));
        });

        group.bench_with_input(BenchmarkId::new("copy_64x64", scale), &scale, |b, &scale| {
            let mut gpu = gpu(scale);
            gpu.update_vram(0, 0, 64, 64, &data, false, false).expect("write");
            b.iter(|| {
                gpu.copy_vram(0, 0, 512, 256, 64, 64, false, false).expect("copy");
            });
        });
    }

    group.finish();
}

fn bench_readback(c: &mut Criterion) {
    c.bench_function("readback_after_draw", |b| {
        let mut gpu = gpu(1);
        let triangle = [
            Vertex::new(0, 0, 0x0000FF),
            Vertex::new(64, 0, 0x00FF00),
            Vertex::new(0, 64, 0xFF0000),
        ];
        let flags = PrimitiveFlags { shaded: true, ..Default::default() };
        b.iter(|| {
            gpu.draw_polygon(&triangle, flags);
            black_box(gpu.read_vram(0, 0, 64, 64).expect("read"));
        });
    });
}

criterion_group!(benches, bench_cpu_transfers, bench_readback);
criterion_main!(benches);
