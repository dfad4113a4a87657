// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Resumable top-down tree builder.
//!
//! A build starts from a flat element list. Oversized and unbounded elements are
//! routed to the global tier up front; the rest seed a root [`WorkSnapshot`].
//! Each call to [`Builder::step`] pops snapshots off a work stack and either
//! emits a leaf or partitions the snapshot into two children, stopping as soon
//! as the per-call element budget is spent. The stack survives between calls,
//! so a build can be spread over as many calls as needed.
//!
//! Partitioning avoids a sort: the snapshot's longest axis is chosen and two
//! split targets are seeded at the min and max corners. Each target is flat on
//! that axis and reaches to the midpoint of the bounds on the other two. Every
//! element joins the target whose squared diagonal grows the least, which lands
//! elements on either side of the midpoint, a cheap stand-in for the median.
//!
//! The budget counts elements assigned during partition plus elements placed
//! into leaves. A leaf is emitted whole, so it is deferred to the next call when
//! it would overrun a budget that is already partly spent. A single call can
//! therefore exceed the budget only when its first piece of work is a leaf
//! larger than the budget (possible at the depth cap or after a degenerate
//! split), and then by at most that leaf's size.

use core::fmt::Debug;
use core::hash::Hash;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::config::TreeConfig;
use crate::directory::{Location, PayloadInfo};
use crate::store::{Leaf, Node, Store};
use crate::types::{Aabb3D, Element, bounds_of};

/// Progress reported by [`AabbTree::progress_build`](crate::AabbTree::progress_build).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    /// No build was running.
    Idle,
    /// The budget ran out; call again to continue.
    InProgress,
    /// The build finished and the new tree is live.
    Completed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    /// Not looked at yet.
    Pending,
    /// Elements `..cursor` have been assigned to a side.
    Partition,
}

/// Build state for one node.
#[derive(Clone, Debug)]
struct WorkSnapshot<P> {
    node: usize,
    depth: usize,
    bounds: Aabb3D,
    elements: Vec<Element<P>>,
    phase: Phase,
    cursor: usize,
    split_targets: [Aabb3D; 2],
    sides: Vec<u8>,
    counts: [usize; 2],
    child_bounds: [Option<Aabb3D>; 2],
}

impl<P: Copy> WorkSnapshot<P> {
    fn new(node: usize, depth: usize, bounds: Aabb3D, elements: Vec<Element<P>>) -> Self {
        Self {
            node,
            depth,
            bounds,
            elements,
            phase: Phase::Pending,
            cursor: 0,
            split_targets: [bounds; 2],
            sides: Vec::new(),
            counts: [0; 2],
            child_bounds: [None; 2],
        }
    }

    fn start_partition(&mut self) {
        let axis = self.bounds.longest_axis();
        let center = self.bounds.center();
        let mut low_max = center;
        low_max[axis] = self.bounds.min[axis];
        let mut high_min = center;
        high_min[axis] = self.bounds.max[axis];
        self.split_targets = [
            Aabb3D::new(self.bounds.min, low_max),
            Aabb3D::new(high_min, self.bounds.max),
        ];
        self.sides = Vec::with_capacity(self.elements.len());
        self.phase = Phase::Partition;
    }

    fn assign_next(&mut self) {
        let bounds = self.elements[self.cursor].bounds;
        let g0 = growth(&self.split_targets[0], &bounds);
        let g1 = growth(&self.split_targets[1], &bounds);
        let side: u8 = if g0 < g1 {
            0
        } else if g1 < g0 {
            1
        } else if self.counts[0] <= self.counts[1] {
            0
        } else {
            1
        };
        self.sides.push(side);
        let side = usize::from(side);
        self.counts[side] += 1;
        self.child_bounds[side] = Some(match self.child_bounds[side] {
            Some(acc) => acc.union(&bounds),
            None => bounds,
        });
        self.cursor += 1;
    }

    fn is_partitioned(&self) -> bool {
        self.cursor == self.elements.len()
    }

    /// Whether a leaf must be emitted instead of children: at the size or depth
    /// limit before partitioning, or when partitioning left a side empty.
    fn ends_in_leaf(&self, config: &TreeConfig) -> bool {
        match self.phase {
            Phase::Pending => {
                self.elements.len() <= config.max_children_in_leaf
                    || self.depth >= config.max_tree_depth
            }
            Phase::Partition => self.child_bounds.iter().any(Option::is_none),
        }
    }
}

/// Increase of the squared diagonal of `target` when it absorbs `bounds`.
fn growth(target: &Aabb3D, bounds: &Aabb3D) -> f64 {
    target.union(bounds).extent().length_squared() - target.extent().length_squared()
}

/// Work stack of an in-progress build.
pub(crate) struct Builder<P> {
    stack: Vec<WorkSnapshot<P>>,
    /// Elements processed by the most recent [`step`](Self::step).
    last_work: usize,
}

impl<P: Copy + Eq + Hash + Debug> Builder<P> {
    /// Reset `target` and seed a build from `source`. The last duplicate of a payload wins.
    pub(crate) fn begin(target: &mut Store<P>, source: impl IntoIterator<Item = Element<P>>) -> Self {
        target.clear();
        let source = source.into_iter();
        let mut seen: HashMap<P, usize> = HashMap::with_capacity(source.size_hint().0);
        let mut unique: Vec<Element<P>> = Vec::with_capacity(source.size_hint().0);
        for element in source {
            match seen.entry(element.payload) {
                Entry::Occupied(slot) => unique[*slot.get()] = element,
                Entry::Vacant(slot) => {
                    slot.insert(unique.len());
                    unique.push(element);
                }
            }
        }

        let mut elements = Vec::with_capacity(unique.len());
        for element in unique {
            let has_bounds = !element.bounds.is_full();
            if let Some(bounds) = target.global_bounds(element.bounds, has_bounds) {
                target.push_global(element.payload, bounds);
            } else {
                target
                    .directory
                    .set(element.payload, PayloadInfo::at(Location::Unplaced));
                elements.push(element);
            }
        }

        let mut stack = Vec::new();
        if let Some(bounds) = bounds_of(&elements) {
            target.nodes.push(Node::Pending);
            target.root = Some((0, bounds));
            stack.push(WorkSnapshot::new(0, 0, bounds, elements));
        }
        tracing::trace!(
            tree = stack.first().map_or(0, |s| s.elements.len()),
            global = target.global.len(),
            "build seeded"
        );
        Self {
            stack,
            last_work: 0,
        }
    }

    /// Run until the stack empties or `budget` elements have been processed.
    ///
    /// Returns `true` once the build is complete.
    pub(crate) fn step(&mut self, target: &mut Store<P>, budget: usize) -> bool {
        let budget = budget.max(1);
        self.last_work = 0;
        while let Some(mut snapshot) = self.stack.pop() {
            if self.last_work >= budget {
                self.stack.push(snapshot);
                return false;
            }
            match snapshot.phase {
                Phase::Pending => {
                    if snapshot.ends_in_leaf(&target.config) {
                        if self.last_work > 0 && self.last_work + snapshot.elements.len() > budget {
                            self.stack.push(snapshot);
                            return false;
                        }
                        self.last_work += snapshot.elements.len();
                        Self::emit_leaf(target, snapshot.node, snapshot.elements);
                    } else {
                        snapshot.start_partition();
                        self.stack.push(snapshot);
                    }
                }
                Phase::Partition => {
                    while !snapshot.is_partitioned() && self.last_work < budget {
                        snapshot.assign_next();
                        self.last_work += 1;
                    }
                    if !snapshot.is_partitioned() {
                        self.stack.push(snapshot);
                        return false;
                    }
                    if snapshot.ends_in_leaf(&target.config) {
                        // Degenerate split: the whole snapshot becomes one leaf. It
                        // stays on the stack, fully partitioned, if the budget is short.
                        if self.last_work > 0 && self.last_work + snapshot.elements.len() > budget {
                            self.stack.push(snapshot);
                            return false;
                        }
                        self.last_work += snapshot.elements.len();
                        Self::emit_leaf(target, snapshot.node, snapshot.elements);
                    } else {
                        self.split(target, snapshot);
                    }
                }
            }
        }
        true
    }

    /// Elements still waiting in the work stack.
    pub(crate) fn pending_elements(&self) -> impl Iterator<Item = &Element<P>> + '_ {
        self.stack.iter().flat_map(|s| s.elements.iter())
    }

    pub(crate) fn last_step_work(&self) -> usize {
        self.last_work
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.stack.iter().map(|s| s.elements.len()).sum()
    }

    fn emit_leaf(target: &mut Store<P>, node: usize, elements: Vec<Element<P>>) {
        debug_assert!(!elements.is_empty(), "builder emitted an empty leaf");
        let leaf = target.leaves.len();
        for e in &elements {
            target.directory.set_location(&e.payload, Location::Leaf(leaf));
        }
        target.leaves.push(Leaf { elements });
        target.nodes[node] = Node::Leaf { leaf };
    }

    fn split(&mut self, target: &mut Store<P>, snapshot: WorkSnapshot<P>) {
        let WorkSnapshot {
            node,
            depth,
            elements,
            sides,
            counts,
            child_bounds,
            ..
        } = snapshot;
        assert_eq!(
            counts[0] + counts[1],
            elements.len(),
            "split assigned a different number of elements than it started with"
        );
        let (Some(low_bounds), Some(high_bounds)) = (child_bounds[0], child_bounds[1]) else {
            debug_assert!(false, "degenerate splits are emitted as leaves by the caller");
            Self::emit_leaf(target, node, elements);
            return;
        };
        let mut low = Vec::with_capacity(counts[0]);
        let mut high = Vec::with_capacity(counts[1]);
        for (element, side) in elements.into_iter().zip(sides) {
            if side == 0 {
                low.push(element);
            } else {
                high.push(element);
            }
        }
        let low_node = target.nodes.len();
        let high_node = low_node + 1;
        target.nodes.push(Node::Pending);
        target.nodes.push(Node::Pending);
        target.nodes[node] = Node::Internal {
            child_bounds: [low_bounds, high_bounds],
            children: [low_node, high_node],
        };
        self.stack
            .push(WorkSnapshot::new(high_node, depth + 1, high_bounds, high));
        self.stack
            .push(WorkSnapshot::new(low_node, depth + 1, low_bounds, low));
    }
}

impl<P> Debug for Builder<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Builder")
            .field("snapshots", &self.stack.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn line_of_boxes(n: u32) -> Vec<Element<u32>> {
        (0..n)
            .map(|i| {
                let x = f64::from(i) * 3.0;
                Element::new(i, Aabb3D::new(DVec3::new(x, 0.0, 0.0), DVec3::new(x + 1.0, 1.0, 1.0)))
            })
            .collect()
    }

    fn leaf_contents(store: &Store<u32>) -> Vec<Vec<u32>> {
        store
            .leaves
            .iter()
            .map(|l| {
                let mut v: Vec<u32> = l.elements.iter().map(|e| e.payload).collect();
                v.sort_unstable();
                v
            })
            .collect()
    }

    fn assert_node_bounds_conservative(store: &Store<u32>) {
        let Some((root, root_bounds)) = store.root else {
            return;
        };
        let mut stack = vec![(root, root_bounds)];
        while let Some((idx, bounds)) = stack.pop() {
            match store.nodes[idx] {
                Node::Internal {
                    child_bounds,
                    children,
                } => {
                    for k in 0..2 {
                        assert!(bounds.contains(&child_bounds[k]), "child box escapes parent");
                        stack.push((children[k], child_bounds[k]));
                    }
                }
                Node::Leaf { leaf } => {
                    for e in &store.leaves[leaf].elements {
                        assert!(bounds.contains(&e.bounds), "element escapes its node");
                    }
                }
                Node::Pending => panic!("pending node left after build"),
            }
        }
    }

    #[test]
    fn splits_until_leaves_are_small() {
        let mut store = Store::new(TreeConfig {
            max_children_in_leaf: 4,
            ..TreeConfig::default()
        });
        let mut b = Builder::begin(&mut store, line_of_boxes(64));
        assert!(b.step(&mut store, usize::MAX));
        assert_eq!(store.leaves.iter().map(|l| l.elements.len()).sum::<usize>(), 64);
        assert!(store.leaves.iter().all(|l| l.elements.len() <= 4));
        assert_node_bounds_conservative(&store);
        store.assert_consistent();
    }

    #[test]
    fn small_budget_matches_single_call() {
        let config = TreeConfig {
            max_children_in_leaf: 3,
            ..TreeConfig::default()
        };
        let mut once = Store::new(config.clone());
        let mut b = Builder::begin(&mut once, line_of_boxes(200));
        assert!(b.step(&mut once, usize::MAX));

        let mut sliced = Store::new(config);
        let mut b = Builder::begin(&mut sliced, line_of_boxes(200));
        let mut calls = 1;
        while !b.step(&mut sliced, 7) {
            calls += 1;
            assert!(b.pending_len() <= 200);
        }
        assert!(calls > 10, "budget should force many calls, got {calls}");
        assert_eq!(leaf_contents(&once), leaf_contents(&sliced));
        sliced.assert_consistent();
    }

    #[test]
    fn identical_boxes_terminate() {
        let mut store = Store::new(TreeConfig {
            max_children_in_leaf: 2,
            max_tree_depth: 4,
            ..TreeConfig::default()
        });
        let unit = Aabb3D::new(DVec3::ZERO, DVec3::ONE);
        let elements: Vec<_> = (0..100_u32).map(|i| Element::new(i, unit)).collect();
        let mut b = Builder::begin(&mut store, elements);
        assert!(b.step(&mut store, usize::MAX));
        assert_eq!(store.leaves.iter().map(|l| l.elements.len()).sum::<usize>(), 100);
        assert_node_bounds_conservative(&store);
    }

    #[test]
    fn degenerate_split_emits_one_big_leaf() {
        let mut store = Store::new(TreeConfig {
            max_children_in_leaf: 2,
            ..TreeConfig::default()
        });
        // A tall column split along Z where every box rests on the floor: all of
        // them land on the low side.
        let elements: Vec<_> = (0..5_u32)
            .map(|i| {
                Element::new(
                    i,
                    Aabb3D::new(DVec3::new(0.0, 0.0, 0.0), DVec3::new(1.0, 1.0, 10.0 - f64::from(i) * 0.1)),
                )
            })
            .collect();
        let mut sliced = Store::new(store.config.clone());
        let mut b = Builder::begin(&mut store, elements.clone());
        assert!(b.step(&mut store, usize::MAX));
        assert_eq!(store.leaves.len(), 1);
        assert_eq!(store.leaves[0].elements.len(), 5);
        // Five assignments plus five leaf placements.
        assert_eq!(b.last_step_work(), 10);
        store.assert_consistent();

        // With a short budget the leaf waits for the next call.
        let mut b = Builder::begin(&mut sliced, elements);
        assert!(!b.step(&mut sliced, 7));
        assert_eq!(b.last_step_work(), 5);
        assert!(sliced.leaves.is_empty());
        assert!(b.step(&mut sliced, 7));
        assert_eq!(b.last_step_work(), 5);
        assert_eq!(leaf_contents(&sliced), leaf_contents(&store));
    }

    #[test]
    fn split_targets_reach_the_midpoint() {
        let bounds = Aabb3D::new(DVec3::ZERO, DVec3::new(10.0, 4.0, 2.0));
        let mut snapshot = WorkSnapshot::new(0, 0, bounds, line_of_boxes(3));
        snapshot.start_partition();
        assert_eq!(
            snapshot.split_targets,
            [
                Aabb3D::new(DVec3::ZERO, DVec3::new(0.0, 2.0, 1.0)),
                Aabb3D::new(DVec3::new(10.0, 2.0, 1.0), DVec3::new(10.0, 4.0, 2.0)),
            ]
        );
    }

    #[test]
    fn off_axis_extent_picks_the_side() {
        // Both boxes span the node on the split axis, so only their position on the
        // other axes tells the targets apart: the one near the max corner goes high
        // even though the low side is empty.
        let bounds = Aabb3D::new(DVec3::ZERO, DVec3::new(10.0, 8.0, 1.0));
        let elements = vec![
            Element::new(1_u32, Aabb3D::new(DVec3::new(0.0, 7.0, 0.5), DVec3::new(10.0, 8.0, 1.0))),
            Element::new(0, Aabb3D::new(DVec3::ZERO, DVec3::new(10.0, 1.0, 0.5))),
        ];
        let mut snapshot = WorkSnapshot::new(0, 0, bounds, elements);
        snapshot.start_partition();
        snapshot.assign_next();
        snapshot.assign_next();
        assert_eq!(snapshot.sides, vec![1, 0]);
    }

    #[test]
    fn calls_stay_within_budget_unless_one_leaf_is_larger() {
        let config = TreeConfig {
            max_children_in_leaf: 2,
            max_tree_depth: 2,
            ..TreeConfig::default()
        };
        let budget = 5;
        let mut store = Store::new(config);
        let mut b = Builder::begin(&mut store, line_of_boxes(64));
        loop {
            let leaves_before = store.leaves.len();
            let done = b.step(&mut store, budget);
            let new_leaves = &store.leaves[leaves_before..];
            let work = b.last_step_work();
            assert!(
                work <= budget
                    || (new_leaves.len() == 1 && new_leaves[0].elements.len() == work),
                "call did {work} work with {} new leaves",
                new_leaves.len()
            );
            if done {
                break;
            }
        }
        assert_eq!(store.leaves.iter().map(|l| l.elements.len()).sum::<usize>(), 64);
        store.assert_consistent();
    }

    #[test]
    fn unbounded_elements_stay_global_without_a_size_limit() {
        let mut store = Store::new(TreeConfig {
            max_payload_bounds: f64::INFINITY,
            ..TreeConfig::default()
        });
        let mut elements = line_of_boxes(10);
        elements.push(Element::new(99, Aabb3D::FULL));
        let mut b = Builder::begin(&mut store, elements);
        assert!(b.step(&mut store, usize::MAX));
        assert_eq!(store.directory.get(&99).unwrap().location, Location::Global(0));
        assert_eq!(store.leaves.iter().map(|l| l.elements.len()).sum::<usize>(), 10);
        let (_, root_bounds) = store.root.unwrap();
        assert!(root_bounds.max_extent().is_finite());
    }

    #[test]
    fn oversized_elements_are_routed_global() {
        let mut store = Store::new(TreeConfig {
            max_payload_bounds: 10.0,
            ..TreeConfig::default()
        });
        let mut elements = line_of_boxes(5);
        elements.push(Element::new(99, Aabb3D::new(DVec3::ZERO, DVec3::splat(50.0))));
        elements.push(Element::new(98, Aabb3D::FULL));
        let mut b = Builder::begin(&mut store, elements);
        assert!(b.step(&mut store, usize::MAX));
        assert_eq!(store.global.len(), 2);
        assert_eq!(store.directory.get(&98).unwrap().location, Location::Global(1));
        store.assert_consistent();
    }

    #[test]
    fn duplicate_payloads_keep_the_last() {
        let mut store = Store::new(TreeConfig::default());
        let first = Aabb3D::new(DVec3::ZERO, DVec3::ONE);
        let last = Aabb3D::new(DVec3::splat(5.0), DVec3::splat(6.0));
        let mut b = Builder::begin(&mut store, [Element::new(1_u32, first), Element::new(1, last)]);
        assert!(b.step(&mut store, usize::MAX));
        assert_eq!(store.len(), 1);
        assert_eq!(store.bounds_of(&1), Some(last));
    }

    #[test]
    fn empty_source_builds_nothing() {
        let mut store: Store<u32> = Store::new(TreeConfig::default());
        let mut b = Builder::begin(&mut store, []);
        assert!(b.step(&mut store, 1));
        assert!(store.root.is_none());
    }
}
