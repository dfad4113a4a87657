// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use glam::DVec3;
use understory_aabb_tree::{
    AabbTree, Aabb3D, BuildStatus, ClosestHit, CollectPayloads, DirtyGridConfig, TreeConfig,
};

#[derive(Clone)]
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
    fn next_f64(&mut self) -> f64 {
        let v = self.next_u64() >> 11;
        (v as f64) / ((1u64 << 53) as f64)
    }
    fn point(&mut self, extent: f64) -> DVec3 {
        DVec3::new(
            self.next_f64() * extent,
            self.next_f64() * extent,
            self.next_f64() * extent,
        )
    }
}

fn gen_random_boxes(count: usize, extent: f64, size: f64) -> Vec<(u32, Aabb3D)> {
    let mut rng = Rng::new(0xCAFE_F00D_DEAD_BEEF);
    (0..count)
        .map(|i| {
            let min = rng.point(extent - size);
            (i as u32, Aabb3D::new(min, min + DVec3::splat(size)))
        })
        .collect()
}

fn gen_clustered_boxes(n_clusters: usize, per_cluster: usize, spread: f64) -> Vec<(u32, Aabb3D)> {
    let mut rng = Rng::new(0xC1A5_7E55_9999_ABCD);
    let centers: Vec<DVec3> = (0..n_clusters).map(|_| rng.point(20_000.0)).collect();
    let mut out = Vec::with_capacity(n_clusters * per_cluster);
    for c in centers {
        for _ in 0..per_cluster {
            let offset = (rng.point(1.0) - DVec3::splat(0.5)) * spread;
            let min = c + offset;
            out.push((out.len() as u32, Aabb3D::new(min, min + DVec3::splat(4.0))));
        }
    }
    out
}

fn built(boxes: &[(u32, Aabb3D)]) -> AabbTree<u32> {
    AabbTree::from_elements(TreeConfig::default(), boxes.iter().copied())
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for &n in &[1_000usize, 10_000, 100_000] {
        let boxes = gen_random_boxes(n, 10_000.0, 8.0);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(format!("from_elements_n{}", n), |b| {
            b.iter(|| black_box(built(&boxes).stats()))
        });
        group.bench_function(format!("time_sliced_n{}", n), |b| {
            b.iter(|| {
                let mut tree =
                    AabbTree::from_elements_time_sliced(TreeConfig::default(), boxes.iter().copied());
                let mut calls = 0usize;
                while tree.progress_build(false) == BuildStatus::InProgress {
                    calls += 1;
                }
                black_box(calls);
            })
        });
    }
    let boxes = gen_clustered_boxes(32, 2_000, 200.0);
    group.bench_function("from_elements_clustered", |b| {
        b.iter(|| black_box(built(&boxes).stats()))
    });
    group.finish();
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");
    let boxes = gen_random_boxes(20_000, 10_000.0, 8.0);
    for (name, grid) in [
        ("grid", DirtyGridConfig::default()),
        ("no_grid", DirtyGridConfig::disabled()),
    ] {
        let config = TreeConfig {
            dirty_grid: grid,
            ..TreeConfig::default()
        };
        group.throughput(Throughput::Elements(5_000));
        group.bench_function(format!("move_5000_{}", name), |b| {
            b.iter_batched(
                || AabbTree::from_elements(config.clone(), boxes.iter().copied()),
                |mut tree| {
                    for (i, bounds) in boxes.iter().take(5_000) {
                        let moved = Aabb3D::new(bounds.min + DVec3::X, bounds.max + DVec3::X);
                        tree.update_element(*i, moved, true);
                    }
                    black_box(tree.stats());
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let boxes = gen_random_boxes(100_000, 10_000.0, 8.0);
    let tree = built(&boxes);
    let mut dirty = built(&boxes);
    for (i, bounds) in boxes.iter().take(9_000) {
        dirty.update_element(*i, Aabb3D::new(bounds.min + DVec3::Y, bounds.max + DVec3::Y), true);
    }
    for (name, tree) in [("clean", &tree), ("dirty", &dirty)] {
        group.bench_function(format!("overlap_{}", name), |b| {
            b.iter(|| {
                let mut v = CollectPayloads::default();
                tree.overlap(
                    Aabb3D::new(DVec3::splat(4_000.0), DVec3::splat(4_600.0)),
                    &mut v,
                );
                black_box(v.payloads.len())
            })
        });
        group.bench_function(format!("raycast_closest_{}", name), |b| {
            let mut rng = Rng::new(0xFACE_FEED_CAFE_BABE);
            b.iter(|| {
                let origin = rng.point(10_000.0);
                let dir = (rng.point(2.0) - DVec3::ONE).normalize_or_zero();
                let mut v = ClosestHit::default();
                tree.raycast(origin, dir, 5_000.0, &mut v);
                black_box(v.hit)
            })
        });
        group.bench_function(format!("sweep_{}", name), |b| {
            b.iter(|| {
                let mut v = CollectPayloads::default();
                tree.sweep(
                    DVec3::splat(100.0),
                    DVec3::ONE.normalize(),
                    2_000.0,
                    DVec3::splat(20.0),
                    &mut v,
                );
                black_box(v.payloads.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_update, bench_query);
criterion_main!(benches);
