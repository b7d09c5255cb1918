//! Tile Indexing Benchmarks
//!
//! Page id to tile arithmetic, run for every request the device reports

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::UVec2;
use texpage_paging::TileLayout;
use texpage_paging::sampler::{TextureSampler, build_mip_level_sizes};
use texpage_paging::tile_indexing::{page_offset_from_tile_coords, tile_coords_from_page_offset};

fn sampler(size: u32, layout: TileLayout) -> TextureSampler {
    let num_mip_levels = 32 - size.leading_zeros();
    let tile = UVec2::splat(128);
    let mip_tail_first_level = (num_mip_levels - 1).min(size.ilog2() - 6).min(8);
    let (mip_level_sizes, num_pages) =
        build_mip_level_sizes(size, size, tile, num_mip_levels, mip_tail_first_level, layout);
    let mut sampler = TextureSampler {
        width: size,
        height: size,
        mip_tail_first_level,
        num_pages,
        mip_level_sizes,
        ..Default::default()
    };
    sampler.desc.set_num_mip_levels(num_mip_levels);
    sampler.desc.set_tile_size(tile);
    sampler.desc.set_tile_layout(layout);
    sampler
}

fn bench_tile_coords(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_coords_round_trip");

    for level_width in [8u32, 64, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(level_width), level_width, |b, &width| {
            b.iter(|| {
                let mut sum = 0u32;
                for offset in 0..width * 8 {
                    let tile = tile_coords_from_page_offset(black_box(offset), width);
                    sum = sum.wrapping_add(page_offset_from_tile_coords(tile.x, tile.y, width));
                }
                sum
            });
        });
    }

    group.finish();
}

fn bench_unpack_tile_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("unpack_tile_index");

    for layout in [TileLayout::Footprint, TileLayout::Linear] {
        let sampler = sampler(16384, layout);
        group.bench_with_input(
            BenchmarkId::new(format!("{layout:?}"), sampler.num_pages),
            &sampler,
            |b, sampler| {
                b.iter(|| {
                    let mut levels = 0u32;
                    for tile_index in (0..sampler.num_pages).step_by(7) {
                        levels += sampler.unpack_tile_index(black_box(tile_index)).mip_level;
                    }
                    levels
                });
            },
        );
    }

    group.finish();
}

fn bench_build_mip_level_sizes(c: &mut Criterion) {
    c.bench_function("build_mip_level_sizes", |b| {
        b.iter(|| {
            build_mip_level_sizes(
                black_box(16384),
                black_box(8192),
                UVec2::splat(128),
                15,
                8,
                TileLayout::Footprint,
            )
        });
    });
}

criterion_group!(
    benches,
    bench_tile_coords,
    bench_unpack_tile_index,
    bench_build_mip_level_sizes
);
criterion_main!(benches);
