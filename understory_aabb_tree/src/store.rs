// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Element storage: tree leaves and nodes, the dirty list, and the global list.
//!
//! A payload lives in exactly one tier at a time and the directory records
//! which. Array-backed tiers remove with swap-with-last, and the element that
//! moves into the hole has its directory entry (and grid back-reference)
//! renamed in the same call.

use core::fmt::Debug;
use core::hash::Hash;

use crate::config::TreeConfig;
use crate::directory::{Location, PayloadDirectory, PayloadInfo};
use crate::dirty_grid::{DirtyGrid, OverflowMove};
use crate::types::{Aabb3D, Element};

/// A bucket of elements at the bottom of the tree.
#[derive(Clone, Debug)]
pub(crate) struct Leaf<P> {
    pub(crate) elements: Vec<Element<P>>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Node {
    /// Two children; each stored box contains everything beneath that child.
    Internal {
        child_bounds: [Aabb3D; 2],
        children: [usize; 2],
    },
    /// Reference into the leaf arena.
    Leaf { leaf: usize },
    /// Allocated by the builder; its snapshot has not been processed yet.
    Pending,
}

pub(crate) struct Store<P> {
    pub(crate) config: TreeConfig,
    pub(crate) nodes: Vec<Node>,
    pub(crate) leaves: Vec<Leaf<P>>,
    /// Root node index and the bounds of everything under it.
    pub(crate) root: Option<(usize, Aabb3D)>,
    pub(crate) dirty: Vec<Element<P>>,
    pub(crate) global: Vec<Element<P>>,
    pub(crate) grid: DirtyGrid,
    pub(crate) directory: PayloadDirectory<P>,
}

impl<P: Copy + Eq + Hash + Debug> Store<P> {
    pub(crate) fn new(config: TreeConfig) -> Self {
        Self {
            grid: DirtyGrid::new(config.dirty_grid.clone()),
            config,
            nodes: Vec::new(),
            leaves: Vec::new(),
            root: None,
            dirty: Vec::new(),
            global: Vec::new(),
            directory: PayloadDirectory::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.leaves.clear();
        self.root = None;
        self.dirty.clear();
        self.global.clear();
        self.grid.clear();
        self.directory.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.directory.len()
    }

    /// Bounds an element should be stored with in the global tier, or `None` if it
    /// belongs in the dirty tier (or a leaf).
    pub(crate) fn global_bounds(&self, bounds: Aabb3D, has_bounds: bool) -> Option<Aabb3D> {
        if !has_bounds {
            Some(Aabb3D::FULL)
        } else if bounds.max_extent() > self.config.max_payload_bounds
            || !bounds.max_extent().is_finite()
        {
            Some(bounds)
        } else {
            None
        }
    }

    /// Insert or move `payload`. Leaves exactly one entry for it.
    pub(crate) fn update(&mut self, payload: P, bounds: Aabb3D, has_bounds: bool) {
        let global = self.global_bounds(bounds, has_bounds);
        let current = self.directory.get(&payload);
        match (current, global) {
            (Some(info), Some(global_bounds)) => {
                if let Location::Global(i) = info.location {
                    self.global[i].bounds = global_bounds;
                } else {
                    self.detach(payload, info);
                    self.push_global(payload, global_bounds);
                }
            }
            (Some(info), None) => {
                if let Location::Dirty(i) = info.location {
                    self.update_dirty(i, info, bounds);
                } else {
                    self.detach(payload, info);
                    self.push_dirty(payload, bounds);
                }
            }
            (None, Some(global_bounds)) => self.push_global(payload, global_bounds),
            (None, None) => self.push_dirty(payload, bounds),
        }
    }

    /// Remove `payload` from whatever tier holds it. Returns whether it was tracked.
    pub(crate) fn remove(&mut self, payload: &P) -> bool {
        let Some(info) = self.directory.get(payload) else {
            return false;
        };
        self.detach(*payload, info);
        self.directory.remove(payload);
        true
    }

    pub(crate) fn bounds_of(&self, payload: &P) -> Option<Aabb3D> {
        let info = self.directory.get(payload)?;
        match info.location {
            Location::Leaf(l) => self.leaves[l]
                .elements
                .iter()
                .find(|e| e.payload == *payload)
                .map(|e| e.bounds),
            Location::Dirty(i) => Some(self.dirty[i].bounds),
            Location::Global(i) => Some(self.global[i].bounds),
            Location::Unplaced => None,
        }
    }

    /// Every stored element, leaves first.
    pub(crate) fn elements(&self) -> impl Iterator<Item = Element<P>> + '_ {
        self.leaves
            .iter()
            .flat_map(|leaf| leaf.elements.iter())
            .chain(self.dirty.iter())
            .chain(self.global.iter())
            .copied()
    }

    pub(crate) fn needs_reoptimize(&self) -> bool {
        self.dirty.len() > self.config.max_dirty_elements
    }

    pub(crate) fn push_global(&mut self, payload: P, bounds: Aabb3D) {
        let idx = self.global.len();
        self.global.push(Element::new(payload, bounds));
        self.directory.set(payload, PayloadInfo::at(Location::Global(idx)));
    }

    fn push_dirty(&mut self, payload: P, bounds: Aabb3D) {
        let idx = self.dirty.len();
        self.dirty.push(Element::new(payload, bounds));
        let overflow = self.grid.add(&bounds, idx);
        self.directory.set(
            payload,
            PayloadInfo {
                location: Location::Dirty(idx),
                overflow,
            },
        );
    }

    fn update_dirty(&mut self, idx: usize, info: PayloadInfo, bounds: Aabb3D) {
        let old = core::mem::replace(&mut self.dirty[idx].bounds, bounds);
        let change = self.grid.update(&old, &bounds, idx, info.overflow);
        if let Some(moved) = change.moved {
            self.apply_overflow_move(moved);
        }
        let payload = self.dirty[idx].payload;
        self.directory.set_overflow(&payload, change.overflow);
    }

    fn apply_overflow_move(&mut self, moved: OverflowMove) {
        let payload = self.dirty[moved.dirty_index].payload;
        self.directory.set_overflow(&payload, Some(moved.slot));
    }

    /// Take `payload` out of its tier. The directory entry is left for the caller.
    fn detach(&mut self, payload: P, info: PayloadInfo) {
        match info.location {
            Location::Leaf(l) => {
                let elements = &mut self.leaves[l].elements;
                let pos = elements.iter().position(|e| e.payload == payload);
                debug_assert!(pos.is_some(), "payload {payload:?} missing from leaf {l}");
                if let Some(pos) = pos {
                    elements.swap_remove(pos);
                }
            }
            Location::Dirty(i) => self.detach_dirty(i, info.overflow),
            Location::Global(i) => {
                assert!(i < self.global.len(), "global index {i} out of range");
                self.global.swap_remove(i);
                if let Some(moved) = self.global.get(i) {
                    self.directory.set_location(&moved.payload, Location::Global(i));
                }
            }
            Location::Unplaced => {
                debug_assert!(false, "unplaced payloads only exist inside a build");
            }
        }
    }

    fn detach_dirty(&mut self, idx: usize, overflow: Option<usize>) {
        assert!(idx < self.dirty.len(), "dirty index {idx} out of range");
        let bounds = self.dirty[idx].bounds;
        if let Some(moved) = self.grid.remove(&bounds, idx, overflow) {
            self.apply_overflow_move(moved);
        }
        let last = self.dirty.len() - 1;
        self.dirty.swap_remove(idx);
        if idx < last {
            let moved = self.dirty[idx];
            let moved_info = self.directory.get(&moved.payload);
            debug_assert!(moved_info.is_some(), "dirty element without directory entry");
            if let Some(moved_info) = moved_info {
                self.grid.relocate(&moved.bounds, last, idx, moved_info.overflow);
            }
            self.directory.set_location(&moved.payload, Location::Dirty(idx));
        }
    }

    /// Panic if any directory entry, tier or grid cell disagrees with another.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut stored = 0;
        for (payload, info) in self.directory.iter() {
            match info.location {
                Location::Leaf(l) => {
                    let hits = self.leaves[l]
                        .elements
                        .iter()
                        .filter(|e| e.payload == *payload)
                        .count();
                    assert_eq!(hits, 1, "{payload:?} should appear once in leaf {l}");
                    assert!(info.overflow.is_none(), "leaf element with overflow slot");
                }
                Location::Dirty(i) => {
                    let e = &self.dirty[i];
                    assert_eq!(e.payload, *payload, "dirty slot {i} holds another payload");
                    if self.grid.is_enabled() {
                        match info.overflow {
                            Some(slot) => {
                                assert_eq!(
                                    self.grid.overflow_slot_of(i),
                                    Some(slot),
                                    "overflow slot"
                                );
                                assert!(
                                    self.grid.cells_of(i).is_empty(),
                                    "overflowed element in cells"
                                );
                            }
                            None => assert_eq!(
                                self.grid.cells_of(i),
                                self.grid.expected_cells(&e.bounds),
                                "grid cells of {payload:?}"
                            ),
                        }
                    } else {
                        assert!(info.overflow.is_none(), "overflow slot with grid disabled");
                    }
                }
                Location::Global(i) => {
                    assert_eq!(
                        self.global[i].payload, *payload,
                        "global slot {i} holds another payload"
                    );
                }
                Location::Unplaced => {}
            }
            if info.location != Location::Unplaced {
                stored += 1;
            }
        }
        let total = self.leaves.iter().map(|l| l.elements.len()).sum::<usize>()
            + self.dirty.len()
            + self.global.len();
        assert_eq!(total, stored, "tiers hold duplicates or untracked elements");
        let overflowed = self
            .directory
            .iter()
            .filter(|(_, info)| info.overflow.is_some())
            .count();
        assert_eq!(self.grid.overflow_len(), overflowed, "overflow list size");
    }
}

impl<P> Debug for Store<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("nodes", &self.nodes.len())
            .field("leaves", &self.leaves.len())
            .field("dirty", &self.dirty.len())
            .field("global", &self.global.len())
            .field("grid", &self.grid)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}
