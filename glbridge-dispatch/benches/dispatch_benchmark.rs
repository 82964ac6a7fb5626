use criterion::{criterion_group, criterion_main, Criterion};
use glbridge_core::{gl, Args};
use glbridge_dispatch::GraphicsBridge;
use glbridge_render::SoftwareSurface;
use std::hint::black_box;

fn bench_immediate_query(c: &mut Criterion) {
    let bridge = GraphicsBridge::with_defaults().unwrap();
    let id = bridge.on_surface_ready(Box::new(SoftwareSurface::new(64, 64))).unwrap();
    let args = Args::new().with("pname", gl::VIEWPORT);

    c.bench_function("immediate_get_parameter", |b| {
        b.iter(|| {
            black_box(bridge.invoke(id, "getParameter", black_box(&args)).unwrap());
        })
    });
}

fn bench_submit_to_resolve(c: &mut Criterion) {
    let bridge = GraphicsBridge::with_defaults().unwrap();
    let id = bridge.on_surface_ready(Box::new(SoftwareSurface::new(64, 64))).unwrap();
    let args = Args::new();

    c.bench_function("deferred_flush_roundtrip", |b| {
        b.iter(|| {
            let pending = bridge.invoke(id, "flush", &args).unwrap().into_pending().unwrap();
            black_box(pending.wait().unwrap());
        })
    });
}

fn bench_batch_then_tick(c: &mut Criterion) {
    let bridge = GraphicsBridge::with_defaults().unwrap();
    let id = bridge.on_surface_ready(Box::new(SoftwareSurface::new(256, 256))).unwrap();
    let clear = Args::new().with("mask", gl::COLOR_BUFFER_BIT);

    // 100 clears on a 256x256 buffer, then present
    c.bench_function("batch_100_clears_then_tick", |b| {
        b.iter(|| {
            for _ in 0..100 {
                black_box(bridge.invoke(id, "clear", &clear).unwrap());
            }
            let frame = bridge.on_frame_tick(id).unwrap().unwrap();
            black_box(frame.wait().unwrap());
        })
    });
}

criterion_group!(benches, bench_immediate_query, bench_submit_to_resolve, bench_batch_then_tick);
criterion_main!(benches);
