use camera_core::capture::{FramePool, PixelFormat, PreviewSize, RawFrame};
use camera_core::distribution::{CountingSink, FrameDistributor, SubscriberId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn frame(size: PreviewSize, sequence: u64) -> RawFrame {
    let len = PixelFormat::Yuv420
        .frame_len(size.width, size.height)
        .unwrap_or_else(|| size.area());
    RawFrame::new(vec![0u8; len], size.width, size.height, PixelFormat::Yuv420, sequence)
}

fn bench_fan_out(c: &mut Criterion) {
    let size = PreviewSize::new(640, 480);
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [0usize, 1, 4, 16] {
        let mut distributor = FrameDistributor::new(PixelFormat::Yuv420);
        for n in 0..subscribers {
            distributor.add(SubscriberId::from(n as u64), Arc::new(CountingSink::new()));
        }
        let pool = FramePool::new(size, PixelFormat::Yuv420, 3);
        let template = frame(size, 0);

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    pool.push(template.clone());
                    black_box(distributor.on_frame_available(&pool))
                })
            },
        );
    }
    group.finish();
}

fn bench_pool_pressure(c: &mut Criterion) {
    let size = PreviewSize::new(320, 240);
    let pool = FramePool::new(size, PixelFormat::Yuv420, 3);
    let template = frame(size, 0);

    c.bench_function("pool_push_drop_oldest", |b| {
        b.iter(|| {
            for _ in 0..8 {
                pool.push(template.clone());
            }
            black_box(pool.acquire_latest())
        })
    });
}

criterion_group!(benches, bench_fan_out, bench_pool_pressure);
criterion_main!(benches);
