// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Primitive geometry types and helpers.

use glam::DVec3;
use kurbo::Rect;

/// Axis-aligned bounding box in 3D.
///
/// Boxes are closed: two boxes that share a face intersect.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb3D {
    /// Minimum corner.
    pub min: DVec3,
    /// Maximum corner.
    pub max: DVec3,
}

impl Aabb3D {
    /// The unbounded box covering all of space.
    ///
    /// Elements inserted without bounds are stored with this value.
    pub const FULL: Self = Self {
        min: DVec3::NEG_INFINITY,
        max: DVec3::INFINITY,
    };

    /// Create a new AABB from min/max corners.
    pub const fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from a center point and half extents.
    pub fn from_center_half_extents(center: DVec3, half_extents: DVec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// A degenerate box containing only `p`.
    pub const fn from_point(p: DVec3) -> Self {
        Self { min: p, max: p }
    }

    /// Whether this is the unbounded sentinel (or at least as large on every axis).
    pub fn is_full(&self) -> bool {
        self.min.cmpeq(DVec3::NEG_INFINITY).all() && self.max.cmpeq(DVec3::INFINITY).all()
    }

    /// Return true if the box is inverted on any axis. Assumes no NaN.
    pub fn is_empty(&self) -> bool {
        self.max.cmplt(self.min).any()
    }

    /// Size along each axis.
    pub fn extent(&self) -> DVec3 {
        self.max - self.min
    }

    /// Midpoint of the box.
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Largest size along any axis.
    pub fn max_extent(&self) -> f64 {
        self.extent().max_element()
    }

    /// Index of the longest axis (ties resolve to the lowest axis).
    pub fn longest_axis(&self) -> usize {
        let e = self.extent();
        if e.x >= e.y && e.x >= e.z {
            0
        } else if e.y >= e.z {
            1
        } else {
            2
        }
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Whether the two boxes overlap (touching counts).
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    /// Whether `other` lies entirely inside this box.
    pub fn contains(&self, other: &Self) -> bool {
        self.min.cmple(other.min).all() && other.max.cmple(self.max).all()
    }

    /// Grow the box by `half_extents` on every side.
    #[must_use]
    pub fn inflate(&self, half_extents: DVec3) -> Self {
        Self {
            min: self.min - half_extents,
            max: self.max + half_extents,
        }
    }

    /// Projection of the box onto the XY plane.
    pub fn footprint(&self) -> Rect {
        Rect::new(self.min.x, self.min.y, self.max.x, self.max.y)
    }

    /// Entry time of the segment `origin + direction * t`, `t` in `[0, max_length]`.
    ///
    /// Returns `None` when the segment misses the box. A segment starting inside
    /// the box reports `0`.
    pub fn ray_entry(&self, origin: DVec3, direction: DVec3, max_length: f64) -> Option<f64> {
        let mut t_min = 0.0_f64;
        let mut t_max = max_length;
        for axis in 0..3 {
            let o = origin[axis];
            let d = direction[axis];
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if d == 0.0 {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t0 = (lo - o) * inv;
            let mut t1 = (hi - o) * inv;
            if t0 > t1 {
                core::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }
        Some(t_min)
    }
}

/// A payload paired with its bounds.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Element<P> {
    /// Caller-owned identity.
    pub payload: P,
    /// World-space bounds, or [`Aabb3D::FULL`] when unbounded.
    pub bounds: Aabb3D,
}

impl<P> Element<P> {
    /// Pair a payload with its bounds.
    pub const fn new(payload: P, bounds: Aabb3D) -> Self {
        Self { payload, bounds }
    }
}

/// Union of all element bounds, or `None` for an empty slice.
pub(crate) fn bounds_of<P>(elements: &[Element<P>]) -> Option<Aabb3D> {
    let (first, rest) = elements.split_first()?;
    Some(rest.iter().fold(first.bounds, |acc, e| acc.union(&e.bounds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Aabb3D {
        Aabb3D::new(DVec3::splat(-1.0), DVec3::splat(1.0))
    }

    #[test]
    fn touching_faces_intersect() {
        let a = unit();
        let b = Aabb3D::new(DVec3::new(1.0, -1.0, -1.0), DVec3::new(3.0, 1.0, 1.0));
        assert!(a.intersects(&b));
        let c = Aabb3D::new(DVec3::new(1.5, -1.0, -1.0), DVec3::new(3.0, 1.0, 1.0));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn full_box_intersects_everything() {
        assert!(Aabb3D::FULL.is_full());
        assert!(Aabb3D::FULL.intersects(&unit()));
        assert!(Aabb3D::FULL.contains(&unit()));
        assert_eq!(Aabb3D::FULL.max_extent(), f64::INFINITY);
    }

    #[test]
    fn ray_entry_hits_and_misses() {
        let b = unit();
        let toi = b.ray_entry(DVec3::new(-5.0, 0.0, 0.0), DVec3::X, 10.0);
        assert_eq!(toi, Some(4.0));
        // Too short to reach the box.
        assert_eq!(b.ray_entry(DVec3::new(-5.0, 0.0, 0.0), DVec3::X, 3.0), None);
        // Parallel to an axis and outside the slab.
        assert_eq!(b.ray_entry(DVec3::new(-5.0, 2.0, 0.0), DVec3::X, 10.0), None);
        // Starting inside.
        assert_eq!(b.ray_entry(DVec3::ZERO, DVec3::Y, 0.5), Some(0.0));
    }

    #[test]
    fn ray_entry_against_full_box() {
        let toi = Aabb3D::FULL.ray_entry(DVec3::new(3.0, 4.0, 5.0), DVec3::new(0.0, 0.6, 0.8), 1.0);
        assert_eq!(toi, Some(0.0));
    }

    #[test]
    fn longest_axis_and_union() {
        let a = Aabb3D::new(DVec3::ZERO, DVec3::new(1.0, 5.0, 2.0));
        assert_eq!(a.longest_axis(), 1);
        let u = a.union(&Aabb3D::from_point(DVec3::new(-3.0, 0.0, 9.0)));
        assert_eq!(u.min, DVec3::new(-3.0, 0.0, 0.0));
        assert_eq!(u.max, DVec3::new(1.0, 5.0, 9.0));
        assert_eq!(u.longest_axis(), 2);
    }
}
