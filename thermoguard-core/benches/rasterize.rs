//! # Thermal Field Benchmarks
//!
//! Measures point interpolation against a warm snapshot and full-field
//! rasterization across resolutions, serial and parallel.
//!
//! Run: `cargo bench --bench rasterize`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use thermoguard_core::{
    GridSpec, InterpolationEngine, MeshConfig, PipelineMetrics, Point, Position, Reading,
};

/// Deterministic scattered field: jittered lattice under a linear gradient
fn scattered_field(side: usize) -> (Vec<(String, Position)>, Vec<Reading>) {
    let mut sensors = Vec::with_capacity(side * side);
    let mut readings = Vec::with_capacity(side * side);
    let mut seed: u64 = 0x5eed_cafe;

    for row in 0..side {
        for col in 0..side {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let jitter_x = ((seed >> 33) % 1000) as f64 / 2500.0;
            let jitter_y = ((seed >> 13) % 1000) as f64 / 2500.0;
            let x = col as f64 * 2.0 + jitter_x;
            let y = row as f64 * 2.0 + jitter_y;
            let id = format!("s-{:03}-{:03}", row, col);
            let value = 18.0 + 0.3 * x + 0.2 * y;

            sensors.push((id.clone(), Position::planar(x, y)));
            readings.push(Reading::celsius(id, "hall", Position::planar(x, y), 0, value));
        }
    }
    (sensors, readings)
}

fn engine_with(side: usize, workers: usize) -> InterpolationEngine {
    let config = MeshConfig {
        raster_workers: workers,
        ..MeshConfig::default()
    };
    let engine = InterpolationEngine::new(&config, Arc::new(PipelineMetrics::new()));
    let (sensors, readings) = scattered_field(side);
    engine.rebuild_mesh(&sensors).ok();
    engine.apply_readings(&readings);
    engine
}

/// Benchmark mesh construction
fn bench_mesh_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("mesh_rebuild");

    for side in [8usize, 16, 32] {
        let (sensors, _) = scattered_field(side);
        let engine = InterpolationEngine::new(&MeshConfig::default(), Arc::new(PipelineMetrics::new()));
        group.throughput(Throughput::Elements(sensors.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sensors.len()), &sensors, |b, s| {
            b.iter(|| black_box(engine.rebuild_mesh(s)))
        });
    }

    group.finish();
}

/// Benchmark single point queries
fn bench_point_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_query");
    let engine = engine_with(16, 1);

    group.bench_function("inside_hull", |b| {
        b.iter(|| black_box(engine.interpolate(black_box(15.3), black_box(11.7))))
    });

    group.bench_function("outside_hull", |b| {
        b.iter(|| black_box(engine.interpolate(black_box(-8.0), black_box(40.0))))
    });

    // Cursor walk along a scan line
    let snapshot = engine.snapshot();
    group.bench_function("cursor_scanline", |b| {
        b.iter(|| {
            let mut cursor = snapshot.cursor();
            for i in 0..128 {
                black_box(cursor.estimate(Point {
                    x: i as f64 * 0.24,
                    y: 15.0,
                }));
            }
        })
    });

    group.finish();
}

/// Benchmark rasterization by resolution and worker count
fn bench_rasterize(c: &mut Criterion) {
    let mut group = c.benchmark_group("rasterize");
    group.sample_size(20);

    for workers in [1usize, 0] {
        let engine = engine_with(16, workers);
        let label = if workers == 1 { "serial" } else { "parallel" };

        let bounds = match engine.snapshot().mesh().bounds() {
            Some(bounds) => bounds,
            None => continue,
        };
        for resolution in [32usize, 128, 256] {
            let spec = GridSpec::square(bounds, resolution);
            group.throughput(Throughput::Elements((resolution * resolution) as u64));
            group.bench_with_input(
                BenchmarkId::new(label, resolution),
                &spec,
                |b, spec| b.iter(|| black_box(engine.rasterize_region(spec))),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_mesh_rebuild, bench_point_queries, bench_rasterize);
criterion_main!(benches);
