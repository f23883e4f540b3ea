//! Performance benchmarks for the swap paths
//!
//! The swapper lock sits on every client and compositor frame, so these
//! guard against regressions in the per-frame cost of the common cycles.

use cgmath::{Matrix4, SquareMatrix};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mir_compositor::compositor::{
    BufferStream, BufferSwapper, BypassMatch, CompositingCriteria, ConsumerId, StreamConfig, SwapPolicy,
};
use mir_compositor::geometry::{Rectangle, Size};
use mir_compositor::graphics::{BufferProperties, BufferUsage, PixelFormat, ShmAllocator};
use mir_compositor::MirConfig;
use std::sync::Arc;

fn properties() -> BufferProperties {
    BufferProperties::new(Size::new(64, 64), PixelFormat::Argb8888, BufferUsage::Software)
}

/// Benchmark one client frame plus one compositor frame
fn bench_swap_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("swap_cycle");

    for (name, nbuffers, policy) in [
        ("double_synchronous", 2, SwapPolicy::Synchronous),
        ("triple_synchronous", 3, SwapPolicy::Synchronous),
        ("triple_framedropping", 3, SwapPolicy::FrameDropping),
    ] {
        let swapper = BufferSwapper::new(&ShmAllocator::new(), properties(), nbuffers, policy).unwrap();
        let consumer = ConsumerId(1);

        group.bench_function(name, |b| {
            b.iter(|| {
                let buffer = swapper.client_acquire().unwrap();
                swapper.client_release(&buffer).unwrap();
                let shown = swapper.compositor_acquire(consumer).unwrap();
                swapper.compositor_release(consumer, black_box(&shown)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark frames shown on several monitors at once
fn bench_multi_monitor(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_monitor");

    for monitors in [1u64, 2, 4] {
        let swapper = BufferSwapper::new(&ShmAllocator::new(), properties(), 3, SwapPolicy::Synchronous).unwrap();
        let consumers: Vec<_> = (1..=monitors).map(ConsumerId).collect();
        for consumer in &consumers {
            swapper.register_consumer(*consumer);
        }

        group.bench_function(format!("{}_monitors", monitors), |b| {
            b.iter(|| {
                let buffer = swapper.client_acquire().unwrap();
                swapper.client_release(&buffer).unwrap();
                for consumer in &consumers {
                    let shown = swapper.compositor_acquire(*consumer).unwrap();
                    swapper.compositor_release(*consumer, &shown).unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark the stream facade, including RAII compositor buffers
fn bench_stream(c: &mut Criterion) {
    let stream = BufferStream::new(StreamConfig::default(), properties(), Arc::new(ShmAllocator::new()), None).unwrap();
    let consumer = ConsumerId(1);

    c.bench_function("stream_frame", |b| {
        b.iter(|| {
            let buffer = stream.swap_buffers_blocking(None).unwrap();
            stream.submit_buffer(&buffer, buffer.size(), Rectangle::from_size(buffer.size())).unwrap();
            black_box(stream.lock_compositor_buffer(consumer).unwrap());
        });
    });
}

struct Plane {
    position: Rectangle,
    alpha: f32,
}

impl CompositingCriteria for Plane {
    fn screen_position(&self) -> Rectangle {
        self.position
    }

    fn alpha(&self) -> f32 {
        self.alpha
    }

    fn shaped(&self) -> bool {
        false
    }

    fn transformation(&self) -> Matrix4<f32> {
        Matrix4::identity()
    }
}

/// Benchmark the bypass decision over growing scenes
fn bench_bypass(c: &mut Criterion) {
    let mut group = c.benchmark_group("bypass_match");
    let view = Rectangle::new(0, 0, 1920, 1080);

    for count in [10usize, 100, 1000] {
        group.bench_function(format!("{}_renderables", count), |b| {
            b.iter_batched(
                || {
                    let mut planes: Vec<Plane> = (0..count)
                        .map(|i| Plane {
                            position: Rectangle::new((i % 1900) as i32, 0, 20, 20),
                            alpha: 0.5,
                        })
                        .collect();
                    planes.push(Plane {
                        position: view,
                        alpha: 1.0,
                    });
                    planes
                },
                |planes| black_box(BypassMatch::find(view, &planes)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark configuration parsing
fn bench_configuration(c: &mut Criterion) {
    let serialized = toml::to_string_pretty(&MirConfig::default()).unwrap();

    c.bench_function("config_parse", |b| {
        b.iter(|| {
            let config: MirConfig = toml::from_str(black_box(&serialized)).unwrap();
            config.validate().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_swap_cycle,
    bench_multi_monitor,
    bench_stream,
    bench_bypass,
    bench_configuration
);
criterion_main!(benches);
