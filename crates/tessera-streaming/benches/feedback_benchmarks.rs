//! Feedback Benchmarks
//!
//! Performance benchmarks for feedback decoding and the per-frame streaming cycle

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::UVec2;
use tessera_core::ManualClock;
use tessera_streaming::feedback::{mark_required_tiles, MinMipMap};
use tessera_streaming::{
    HeadlessBackend, SourceTexture, SourceTextureId, StreamingBackend, StreamingConfig,
    StreamingPipeline, TextureDesc, TileShape,
};
use wgpu::TextureFormat;

fn bc7(name: &str, size: u32) -> TextureDesc {
    TextureDesc::new_2d(
        name,
        TextureFormat::Bc7RgbaUnorm,
        size,
        size,
        TextureDesc::full_mip_chain(size, size),
    )
}

/// Resolve data sampling every region at a mip that varies across the grid
fn resolve_data(grid: UVec2) -> Vec<u8> {
    (0..grid.y)
        .flat_map(|y| (0..grid.x).map(move |x| ((x + y) % 4) as u8))
        .collect()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("min_mip_decode");

    for size in [1024u32, 4096, 16384].iter() {
        let backend = HeadlessBackend::new();
        let tiling = backend.query_tiling(&bc7("bench", *size)).unwrap();
        let grid = tiling.feedback_grid();
        let data = resolve_data(grid);

        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(MinMipMap::decode(grid, data).unwrap()));
        });
    }

    group.finish();
}

fn bench_mark_required(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark_required_tiles");

    for size in [1024u32, 4096, 16384].iter() {
        let backend = HeadlessBackend::new();
        let tiling = backend.query_tiling(&bc7("bench", *size)).unwrap();
        let map = MinMipMap::decode(tiling.feedback_grid(), &resolve_data(tiling.feedback_grid())).unwrap();
        let mut required = vec![false; tiling.num_tiles as usize];

        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                required.fill(false);
                mark_required_tiles(&tiling, &map, &mut required);
                black_box(&required);
            });
        });
    }

    group.finish();
}

fn bench_frame_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_cycle");

    for count in [4u64, 32].iter() {
        let mut backend = HeadlessBackend::with_tile_shape(TileShape::new(64, 64));
        let config = StreamingConfig {
            frames_in_flight: 1,
            ..Default::default()
        };
        let mut pipeline =
            StreamingPipeline::with_clock(&mut backend, config, Arc::new(ManualClock::new())).unwrap();
        let textures = (0..*count)
            .map(|id| {
                Arc::new(SourceTexture::filled(
                    SourceTextureId(id),
                    bc7(&format!("texture_{id}"), 512),
                    id as u8,
                ))
            })
            .collect();
        pipeline.load_scene(&mut backend, textures, Vec::new()).unwrap();
        let surfaces: Vec<_> = pipeline
            .manager()
            .textures()
            .map(|(_, texture)| texture.feedback_surface())
            .collect();

        let mut frame = 0u64;
        group.bench_function(BenchmarkId::from_parameter(count), |b| {
            b.iter(|| {
                black_box(pipeline.before_render(&mut backend, frame).unwrap());
                for &surface in &surfaces {
                    backend.record_sample(surface, 0, 0, (frame % 3) as u8);
                }
                black_box(pipeline.after_render(&mut backend));
                frame += 1;
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_mark_required, bench_frame_cycle);
criterion_main!(benches);
