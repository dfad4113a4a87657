// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Helpers shared by the unit tests: a deterministic RNG and a brute-force oracle.

use std::collections::HashMap;
use std::collections::HashSet;

use glam::DVec3;

use crate::query::QueryShape;
use crate::types::Aabb3D;

#[derive(Clone)]
pub(crate) struct Rng(u64);

impl Rng {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub(crate) fn next_f64(&mut self) -> f64 {
        let v = self.next_u64() >> 11;
        (v as f64) / ((1_u64 << 53) as f64)
    }

    pub(crate) fn range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    pub(crate) fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }

    pub(crate) fn point(&mut self, extent: f64) -> DVec3 {
        DVec3::new(
            self.range(0.0, extent),
            self.range(0.0, extent),
            self.range(0.0, extent),
        )
    }

    /// A box with its min corner inside `[0, extent)^3` and sides up to `max_size`.
    pub(crate) fn aabb(&mut self, extent: f64, max_size: f64) -> Aabb3D {
        let min = self.point(extent);
        let size = DVec3::new(
            self.range(0.0, max_size),
            self.range(0.0, max_size),
            self.range(0.0, max_size),
        );
        Aabb3D::new(min, min + size)
    }

    pub(crate) fn direction(&mut self) -> DVec3 {
        loop {
            let d = DVec3::new(
                self.range(-1.0, 1.0),
                self.range(-1.0, 1.0),
                self.range(-1.0, 1.0),
            );
            if d.length_squared() > 1e-3 {
                return d.normalize();
            }
        }
    }
}

/// Reference model: the bounds every payload should have.
#[derive(Default)]
pub(crate) struct Model {
    pub(crate) bounds: HashMap<u32, Aabb3D>,
}

impl Model {
    pub(crate) fn update(&mut self, payload: u32, bounds: Aabb3D, has_bounds: bool) {
        let stored = if has_bounds { bounds } else { Aabb3D::FULL };
        self.bounds.insert(payload, stored);
    }

    pub(crate) fn remove(&mut self, payload: u32) {
        self.bounds.remove(&payload);
    }

    pub(crate) fn expected(&self, shape: &QueryShape) -> HashSet<u32> {
        self.bounds
            .iter()
            .filter(|(_, b)| shape.test(b, shape.initial_length()).is_some())
            .map(|(p, _)| *p)
            .collect()
    }
}

/// Turn a visit list into a set, failing on duplicates.
pub(crate) fn unique(hits: Vec<u32>) -> HashSet<u32> {
    let n = hits.len();
    let set: HashSet<u32> = hits.into_iter().collect();
    assert_eq!(set.len(), n, "an element was visited more than once");
    set
}
