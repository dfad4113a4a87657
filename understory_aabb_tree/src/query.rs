// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Query shapes, visitors, and the traversal shared by raycast, sweep and overlap.
//!
//! A query visits the global list first, then the dirty list (through the dirty
//! grid when it can), then the tree. Every element whose bounds pass the shape
//! test is handed to the [`Visitor`] exactly once. For rays and sweeps the
//! visitor may shorten the remaining length through [`Cursor::clip`]; pruning
//! from then on uses the shorter length.

use core::ops::ControlFlow;

use bitflags::bitflags;
use glam::DVec3;
use kurbo::{Point, Vec2};

use crate::dirty_grid::DirtyGrid;
use crate::store::{Node, Store};
use crate::types::{Aabb3D, Element};

bitflags! {
    /// Which storage tiers a query visits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct QueryTiers: u8 {
        /// Unbounded and oversized elements.
        const GLOBAL = 1;
        /// Recently updated elements not yet folded into the tree.
        const DIRTY = 1 << 1;
        /// Elements in tree leaves.
        const TREE = 1 << 2;
    }
}

impl Default for QueryTiers {
    fn default() -> Self {
        Self::all()
    }
}

/// The tier a [`Candidate`] was found in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// The global list.
    Global,
    /// The dirty list.
    Dirty,
    /// A tree leaf (or an in-progress build).
    Tree,
}

/// The geometric part of a query.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum QueryShape {
    /// Segment `origin + direction * t` for `t` in `[0, max_length]`.
    Raycast {
        /// Start point.
        origin: DVec3,
        /// Direction; lengths are measured in multiples of it.
        direction: DVec3,
        /// Initial length of the segment.
        max_length: f64,
    },
    /// A box with `half_extents` moved along a segment.
    Sweep {
        /// Start point of the box center.
        origin: DVec3,
        /// Direction; lengths are measured in multiples of it.
        direction: DVec3,
        /// Initial length of the segment.
        max_length: f64,
        /// Half size of the swept box.
        half_extents: DVec3,
    },
    /// A static box.
    Overlap {
        /// The query box.
        bounds: Aabb3D,
    },
}

impl QueryShape {
    /// Length the cursor starts with.
    pub fn initial_length(&self) -> f64 {
        match self {
            Self::Raycast { max_length, .. } | Self::Sweep { max_length, .. } => *max_length,
            Self::Overlap { .. } => f64::INFINITY,
        }
    }

    /// Test `bounds` against the shape with the current `length`.
    ///
    /// Returns the time of impact (`0` for overlaps) when it passes.
    pub fn test(&self, bounds: &Aabb3D, length: f64) -> Option<f64> {
        match self {
            Self::Raycast {
                origin, direction, ..
            } => bounds.ray_entry(*origin, *direction, length),
            Self::Sweep {
                origin,
                direction,
                half_extents,
                ..
            } => bounds
                .inflate(*half_extents)
                .ray_entry(*origin, *direction, length),
            Self::Overlap { bounds: query } => bounds.intersects(query).then_some(0.0),
        }
    }

    /// Dirty-list visitation order from the grid, or `None` to scan linearly.
    fn dirty_order(&self, grid: &DirtyGrid) -> Option<Vec<usize>> {
        match self {
            Self::Overlap { bounds } => grid.query_rect(bounds.footprint()),
            Self::Raycast {
                origin,
                direction,
                max_length,
            } => Self::segment_order(grid, *origin, *direction, *max_length, Vec2::ZERO),
            Self::Sweep {
                origin,
                direction,
                max_length,
                half_extents,
            } => Self::segment_order(
                grid,
                *origin,
                *direction,
                *max_length,
                Vec2::new(half_extents.x, half_extents.y),
            ),
        }
    }

    fn segment_order(
        grid: &DirtyGrid,
        origin: DVec3,
        direction: DVec3,
        max_length: f64,
        half_extents: Vec2,
    ) -> Option<Vec<usize>> {
        let end = origin + direction * max_length;
        if !end.is_finite() || !origin.is_finite() {
            return None;
        }
        grid.query_segment(
            Point::new(origin.x, origin.y),
            Point::new(end.x, end.y),
            half_extents,
        )
    }
}

/// Mutable query state handed to visitors.
#[derive(Clone, Debug)]
pub struct Cursor {
    length: f64,
}

impl Cursor {
    pub(crate) fn new(length: f64) -> Self {
        Self { length }
    }

    /// Current segment length; infinite for overlaps.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Shorten the segment. Longer values are ignored.
    pub fn clip(&mut self, length: f64) {
        if length < self.length {
            self.length = length;
        }
    }
}

/// An element that passed the shape test.
#[derive(Debug)]
pub struct Candidate<'a, P> {
    /// The element's payload.
    pub payload: &'a P,
    /// The element's stored bounds.
    pub bounds: &'a Aabb3D,
    /// Time of impact along the segment; `0` for overlaps.
    pub toi: f64,
    /// Where the element was found.
    pub tier: Tier,
}

/// Receives query results.
///
/// Returning [`ControlFlow::Break`] from either method ends the query at once.
pub trait Visitor<P> {
    /// Called for each element that passes the shape test.
    fn visit(&mut self, candidate: &Candidate<'_, P>, cursor: &mut Cursor) -> ControlFlow<()>;

    /// Called for each tree node the traversal enters.
    fn visit_node(&mut self, bounds: &Aabb3D) -> ControlFlow<()> {
        let _ = bounds;
        ControlFlow::Continue(())
    }
}

/// Collects every payload visited.
#[derive(Clone, Debug)]
pub struct CollectPayloads<P> {
    /// Payloads in visitation order.
    pub payloads: Vec<P>,
}

impl<P> Default for CollectPayloads<P> {
    fn default() -> Self {
        Self {
            payloads: Vec::new(),
        }
    }
}

impl<P: Copy> Visitor<P> for CollectPayloads<P> {
    fn visit(&mut self, candidate: &Candidate<'_, P>, _: &mut Cursor) -> ControlFlow<()> {
        self.payloads.push(*candidate.payload);
        ControlFlow::Continue(())
    }
}

/// Keeps the nearest hit of a raycast or sweep, clipping the segment as it goes.
#[derive(Clone, Debug)]
pub struct ClosestHit<P> {
    /// Nearest payload and its time of impact.
    pub hit: Option<(P, f64)>,
}

impl<P> Default for ClosestHit<P> {
    fn default() -> Self {
        Self { hit: None }
    }
}

impl<P: Copy> Visitor<P> for ClosestHit<P> {
    fn visit(&mut self, candidate: &Candidate<'_, P>, cursor: &mut Cursor) -> ControlFlow<()> {
        if self.hit.is_none_or(|(_, toi)| candidate.toi < toi) {
            self.hit = Some((*candidate.payload, candidate.toi));
            cursor.clip(candidate.toi);
        }
        ControlFlow::Continue(())
    }
}

/// Test and report a run of elements.
pub(crate) fn visit_elements<'a, P: 'a, V, F>(
    shape: &QueryShape,
    elements: impl IntoIterator<Item = &'a Element<P>>,
    tier: Tier,
    keep: &F,
    cursor: &mut Cursor,
    visitor: &mut V,
) -> ControlFlow<()>
where
    V: Visitor<P> + ?Sized,
    F: Fn(&P) -> bool,
{
    for e in elements {
        if !keep(&e.payload) {
            continue;
        }
        if let Some(toi) = shape.test(&e.bounds, cursor.length()) {
            let candidate = Candidate {
                payload: &e.payload,
                bounds: &e.bounds,
                toi,
                tier,
            };
            visitor.visit(&candidate, cursor)?;
        }
    }
    ControlFlow::Continue(())
}

/// Run a query over one store: global list, dirty list, then the tree.
pub(crate) fn query_store<P, V, F>(
    store: &Store<P>,
    shape: &QueryShape,
    tiers: QueryTiers,
    keep: &F,
    cursor: &mut Cursor,
    visitor: &mut V,
) -> ControlFlow<()>
where
    V: Visitor<P> + ?Sized,
    F: Fn(&P) -> bool,
{
    if tiers.contains(QueryTiers::GLOBAL) {
        visit_elements(shape, &store.global, Tier::Global, keep, cursor, visitor)?;
    }
    if tiers.contains(QueryTiers::DIRTY) && !store.dirty.is_empty() {
        match shape.dirty_order(&store.grid) {
            Some(order) => visit_elements(
                shape,
                order.into_iter().map(|i| &store.dirty[i]),
                Tier::Dirty,
                keep,
                cursor,
                visitor,
            )?,
            None => visit_elements(shape, &store.dirty, Tier::Dirty, keep, cursor, visitor)?,
        }
    }
    if tiers.contains(QueryTiers::TREE) {
        traverse_tree(store, shape, keep, cursor, visitor)?;
    }
    ControlFlow::Continue(())
}

fn traverse_tree<P, V, F>(
    store: &Store<P>,
    shape: &QueryShape,
    keep: &F,
    cursor: &mut Cursor,
    visitor: &mut V,
) -> ControlFlow<()>
where
    V: Visitor<P> + ?Sized,
    F: Fn(&P) -> bool,
{
    let Some((root, root_bounds)) = store.root else {
        return ControlFlow::Continue(());
    };
    let mut stack = vec![(root, root_bounds)];
    while let Some((idx, bounds)) = stack.pop() {
        // The cursor may have been clipped since this node was pushed.
        if shape.test(&bounds, cursor.length()).is_none() {
            continue;
        }
        visitor.visit_node(&bounds)?;
        match &store.nodes[idx] {
            Node::Internal {
                child_bounds,
                children,
            } => {
                let t0 = shape.test(&child_bounds[0], cursor.length());
                let t1 = shape.test(&child_bounds[1], cursor.length());
                // Push the farther child first so the nearer one is explored first.
                let order = match (t0, t1) {
                    (Some(a), Some(b)) if b < a => [0, 1],
                    _ => [1, 0],
                };
                for k in order {
                    let hit = if k == 0 { t0 } else { t1 };
                    if hit.is_some() {
                        stack.push((children[k], child_bounds[k]));
                    }
                }
            }
            Node::Leaf { leaf } => {
                visit_elements(
                    shape,
                    &store.leaves[*leaf].elements,
                    Tier::Tree,
                    keep,
                    cursor,
                    visitor,
                )?;
            }
            Node::Pending => {}
        }
    }
    ControlFlow::Continue(())
}
