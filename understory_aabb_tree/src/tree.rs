// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The public [`AabbTree`]: element lifecycle, builds, and queries.

use core::fmt::Debug;
use core::hash::Hash;
use core::ops::ControlFlow;
use std::collections::HashMap;

use glam::DVec3;

use crate::builder::{BuildStatus, Builder};
use crate::config::TreeConfig;
use crate::directory::Location;
use crate::query::{
    ClosestHit, CollectPayloads, Cursor, QueryShape, QueryTiers, Tier, Visitor, query_store,
    visit_elements,
};
use crate::store::Store;
use crate::types::{Aabb3D, Element};

/// A mutation made while a build was running, replayed when the build lands.
#[derive(Copy, Clone, Debug)]
enum Change {
    Update { bounds: Aabb3D, has_bounds: bool },
    Remove,
}

struct PendingBuild<P> {
    target: Store<P>,
    builder: Builder<P>,
    changes: HashMap<P, Change>,
    /// Set when the live store holds none of the elements being built, so queries
    /// must look inside the build as well.
    initial: bool,
}

/// Counters describing the live structure.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Payloads tracked, including those still inside an initial build.
    pub elements: usize,
    /// Elements stored in tree leaves.
    pub leaf_elements: usize,
    /// Elements in the dirty list.
    pub dirty: usize,
    /// Dirty elements the grid keeps in its overflow list.
    pub overflow: usize,
    /// Elements in the global list.
    pub global: usize,
    /// Leaves in the tree.
    pub leaves: usize,
    /// Nodes in the tree.
    pub nodes: usize,
    /// Occupied dirty-grid cells.
    pub grid_cells: usize,
    /// Whether a time-sliced build is running.
    pub building: bool,
}

/// Dynamic 3D AABB tree.
///
/// Updated elements go to a dirty list indexed by a coarse grid; they only join
/// the tree when it is rebuilt, either explicitly or when the dirty list grows
/// past [`TreeConfig::max_dirty_elements`]. Rebuilds can be time-sliced with
/// [`begin_reoptimize`](Self::begin_reoptimize) and
/// [`progress_build`](Self::progress_build); the old structure keeps answering
/// queries until the new one is swapped in whole.
///
/// Mutation takes `&mut self` and queries take `&self`, so the borrow checker
/// enforces the single-writer rule. There is no internal locking.
pub struct AabbTree<P> {
    live: Store<P>,
    build: Option<PendingBuild<P>>,
}

impl<P: Copy + Eq + Hash + Debug> Default for AabbTree<P> {
    fn default() -> Self {
        Self::new(TreeConfig::default())
    }
}

impl<P: Copy + Eq + Hash + Debug> AabbTree<P> {
    /// Create an empty tree.
    pub fn new(config: TreeConfig) -> Self {
        Self {
            live: Store::new(config),
            build: None,
        }
    }

    /// Build a tree from `(payload, bounds)` pairs in one call.
    ///
    /// Pass [`Aabb3D::FULL`] for elements without bounds.
    pub fn from_elements(config: TreeConfig, elements: impl IntoIterator<Item = (P, Aabb3D)>) -> Self {
        let mut tree = Self::from_elements_time_sliced(config, elements);
        tree.progress_build(true);
        tree
    }

    /// Start building a tree from `(payload, bounds)` pairs and return without doing
    /// any partitioning work.
    ///
    /// Drive the build with [`progress_build`](Self::progress_build). Every element
    /// is queryable in the meantime.
    pub fn from_elements_time_sliced(
        config: TreeConfig,
        elements: impl IntoIterator<Item = (P, Aabb3D)>,
    ) -> Self {
        let mut tree = Self::new(config);
        let source = elements.into_iter().map(|(p, b)| Element::new(p, b));
        tree.start_build(source, true);
        tree
    }

    /// The configuration this tree was created with.
    pub fn config(&self) -> &TreeConfig {
        &self.live.config
    }

    /// Insert or move an element.
    ///
    /// Elements without bounds, or whose longest extent exceeds
    /// [`TreeConfig::max_payload_bounds`], are kept in the global list. Everything
    /// else goes to the dirty list. May run a synchronous [`reoptimize`](Self::reoptimize).
    pub fn update_element(&mut self, payload: P, bounds: Aabb3D, has_bounds: bool) {
        self.live.update(payload, bounds, has_bounds);
        if let Some(build) = &mut self.build {
            build.changes.insert(payload, Change::Update { bounds, has_bounds });
        }
        if self.live.needs_reoptimize() {
            tracing::debug!(
                dirty = self.live.dirty.len(),
                limit = self.live.config.max_dirty_elements,
                "dirty list over limit, reoptimizing"
            );
            self.reoptimize();
        }
    }

    /// Remove an element. Removing an untracked payload does nothing.
    pub fn remove_element(&mut self, payload: P) {
        self.live.remove(&payload);
        if let Some(build) = &mut self.build {
            build.changes.insert(payload, Change::Remove);
        }
    }

    /// Drop every element and any running build.
    pub fn reset(&mut self) {
        self.live.clear();
        self.build = None;
    }

    /// Rebuild the tree from every tracked element, synchronously.
    ///
    /// Any running time-sliced build is abandoned.
    pub fn reoptimize(&mut self) {
        let elements = self.gather();
        self.build = None;
        tracing::debug!(elements = elements.len(), "synchronous reoptimize");
        let mut target = Store::new(self.live.config.clone());
        let mut builder = Builder::begin(&mut target, elements);
        let done = builder.step(&mut target, usize::MAX);
        debug_assert!(done, "unbounded build step left work behind");
        self.live = target;
    }

    /// Start a time-sliced rebuild of every tracked element.
    ///
    /// The current structure keeps serving queries and absorbing updates until
    /// [`progress_build`](Self::progress_build) completes the rebuild.
    pub fn begin_reoptimize(&mut self) {
        if self.build.as_ref().is_some_and(|b| b.initial) {
            // The live store is not authoritative until an initial build lands.
            self.progress_build(true);
        }
        let elements: Vec<_> = self.live.elements().collect();
        tracing::debug!(elements = elements.len(), "time-sliced reoptimize started");
        self.start_build(elements, false);
    }

    /// Advance a running build by one budget's worth of work.
    ///
    /// With `force_finish` the budget is unlimited and the build completes in
    /// this call. On completion the new structure replaces the old one and any
    /// updates or removals made in the meantime are applied to it.
    pub fn progress_build(&mut self, force_finish: bool) -> BuildStatus {
        let budget = if force_finish {
            usize::MAX
        } else {
            self.live.config.max_elements_per_build_step
        };
        let Some(build) = &mut self.build else {
            return BuildStatus::Idle;
        };
        if !build.builder.step(&mut build.target, budget) {
            tracing::trace!(
                work = build.builder.last_step_work(),
                remaining = build.builder.pending_len(),
                "build step done"
            );
            return BuildStatus::InProgress;
        }
        let Some(PendingBuild {
            mut target,
            changes,
            ..
        }) = self.build.take()
        else {
            return BuildStatus::Idle;
        };
        let replayed = changes.len();
        for (payload, change) in changes {
            match change {
                Change::Update { bounds, has_bounds } => target.update(payload, bounds, has_bounds),
                Change::Remove => {
                    target.remove(&payload);
                }
            }
        }
        self.live = target;
        tracing::debug!(
            leaves = self.live.leaves.len(),
            nodes = self.live.nodes.len(),
            replayed,
            "build complete"
        );
        if self.live.needs_reoptimize() {
            self.reoptimize();
        }
        BuildStatus::Completed
    }

    /// Whether a time-sliced build is running.
    pub fn is_building(&self) -> bool {
        self.build.is_some()
    }

    /// Number of tracked payloads.
    pub fn len(&self) -> usize {
        let mut n = self.live.len();
        if let Some(build) = self.initial_build() {
            let shadowed = build
                .changes
                .keys()
                .filter(|p| build.target.directory.contains(p))
                .count();
            n += build.target.len() - shadowed;
        }
        n
    }

    /// Whether no payloads are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `payload` is tracked.
    pub fn contains(&self, payload: &P) -> bool {
        self.location(payload).is_some()
    }

    /// Where `payload` is stored.
    pub fn location(&self, payload: &P) -> Option<Location> {
        if let Some(info) = self.live.directory.get(payload) {
            return Some(info.location);
        }
        let build = self.initial_build()?;
        if build.changes.contains_key(payload) {
            return None;
        }
        build.target.directory.get(payload).map(|info| info.location)
    }

    /// Stored bounds of `payload` ([`Aabb3D::FULL`] for unbounded elements).
    pub fn bounds_of(&self, payload: &P) -> Option<Aabb3D> {
        match self.location(payload)? {
            Location::Unplaced => self
                .initial_build()?
                .builder
                .pending_elements()
                .find(|e| e.payload == *payload)
                .map(|e| e.bounds),
            _ if self.live.directory.contains(payload) => self.live.bounds_of(payload),
            _ => self.initial_build()?.target.bounds_of(payload),
        }
    }

    /// Counters for the live structure.
    pub fn stats(&self) -> TreeStats {
        TreeStats {
            elements: self.len(),
            leaf_elements: self.live.leaves.iter().map(|l| l.elements.len()).sum(),
            dirty: self.live.dirty.len(),
            overflow: self.live.grid.overflow_len(),
            global: self.live.global.len(),
            leaves: self.live.leaves.len(),
            nodes: self.live.nodes.len(),
            grid_cells: self.live.grid.cell_count(),
            building: self.build.is_some(),
        }
    }

    /// Visit elements hit by the segment `origin + direction * t`, `t` in `[0, max_length]`.
    pub fn raycast<V: Visitor<P> + ?Sized>(
        &self,
        origin: DVec3,
        direction: DVec3,
        max_length: f64,
        visitor: &mut V,
    ) {
        let shape = QueryShape::Raycast {
            origin,
            direction,
            max_length,
        };
        self.query(&shape, QueryTiers::all(), visitor);
    }

    /// Visit elements touched by a box with `half_extents` moved along a segment.
    pub fn sweep<V: Visitor<P> + ?Sized>(
        &self,
        origin: DVec3,
        direction: DVec3,
        max_length: f64,
        half_extents: DVec3,
        visitor: &mut V,
    ) {
        let shape = QueryShape::Sweep {
            origin,
            direction,
            max_length,
            half_extents,
        };
        self.query(&shape, QueryTiers::all(), visitor);
    }

    /// Visit elements whose bounds intersect `bounds`.
    pub fn overlap<V: Visitor<P> + ?Sized>(&self, bounds: Aabb3D, visitor: &mut V) {
        self.query(&QueryShape::Overlap { bounds }, QueryTiers::all(), visitor);
    }

    /// Payloads whose bounds intersect `bounds`.
    pub fn find_all_intersections(&self, bounds: Aabb3D) -> Vec<P> {
        let mut collect = CollectPayloads::default();
        self.overlap(bounds, &mut collect);
        collect.payloads
    }

    /// Nearest element hit by a ray, with its time of impact.
    pub fn raycast_closest(
        &self,
        origin: DVec3,
        direction: DVec3,
        max_length: f64,
    ) -> Option<(P, f64)> {
        let mut closest = ClosestHit::default();
        self.raycast(origin, direction, max_length, &mut closest);
        closest.hit
    }

    /// Run `shape` over the selected tiers: global, then dirty, then tree.
    pub fn query<V: Visitor<P> + ?Sized>(
        &self,
        shape: &QueryShape,
        tiers: QueryTiers,
        visitor: &mut V,
    ) {
        let mut cursor = Cursor::new(shape.initial_length());
        let _ = self.run_query(shape, tiers, &mut cursor, visitor);
    }

    fn run_query<V: Visitor<P> + ?Sized>(
        &self,
        shape: &QueryShape,
        tiers: QueryTiers,
        cursor: &mut Cursor,
        visitor: &mut V,
    ) -> ControlFlow<()> {
        let everything = |_: &P| true;
        let build = self.initial_build();
        for tier in [QueryTiers::GLOBAL, QueryTiers::DIRTY, QueryTiers::TREE] {
            if !tiers.contains(tier) {
                continue;
            }
            query_store(&self.live, shape, tier, &everything, cursor, visitor)?;
            if let Some(build) = build {
                let unchanged = |p: &P| !build.changes.contains_key(p);
                query_store(&build.target, shape, tier, &unchanged, cursor, visitor)?;
                if tier == QueryTiers::TREE {
                    visit_elements(
                        shape,
                        build.builder.pending_elements(),
                        Tier::Tree,
                        &unchanged,
                        cursor,
                        visitor,
                    )?;
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn initial_build(&self) -> Option<&PendingBuild<P>> {
        self.build.as_ref().filter(|b| b.initial)
    }

    /// Every tracked element, including those inside an initial build.
    fn gather(&self) -> Vec<Element<P>> {
        let mut out: Vec<Element<P>> = self.live.elements().collect();
        if let Some(build) = self.initial_build() {
            let unchanged = |e: &Element<P>| !build.changes.contains_key(&e.payload);
            out.extend(build.target.elements().filter(unchanged));
            out.extend(build.builder.pending_elements().copied().filter(unchanged));
        }
        out
    }

    fn start_build(&mut self, elements: impl IntoIterator<Item = Element<P>>, initial: bool) {
        let mut target = Store::new(self.live.config.clone());
        let builder = Builder::begin(&mut target, elements);
        self.build = Some(PendingBuild {
            target,
            builder,
            changes: HashMap::new(),
            initial,
        });
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        self.live.assert_consistent();
        if let Some(build) = &self.build {
            build.target.assert_consistent();
        }
    }
}

impl<P> Debug for AabbTree<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AabbTree")
            .field("live", &self.live)
            .field("building", &self.build.is_some())
            .finish_non_exhaustive()
    }
}
