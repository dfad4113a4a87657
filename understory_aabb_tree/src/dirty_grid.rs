// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sparse uniform grid over the dirty list.
//!
//! Cells are keyed by `(floor(x / cell_size), floor(y / cell_size))`; height is
//! not gridded. Each cell keeps the dirty-list indices of the elements whose
//! footprint overlaps it, sorted ascending. Elements that cover too many cells,
//! or that would land in a full cell, live in a flat overflow list instead.
//! Queries merge the per-cell lists and the overflow list into one ascending,
//! duplicate-free visitation order.

use core::cmp::Reverse;
use core::fmt::Debug;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use kurbo::{Point, Rect, Vec2};

use crate::config::DirtyGridConfig;
use crate::types::Aabb3D;

type CellKey = (i64, i64);

/// Crossing parameters closer than this are treated as passing through a corner.
const CORNER_TOLERANCE: f64 = 1e-9;

/// Inclusive rectangle of cell coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct CellRange {
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
}

impl CellRange {
    fn count(&self) -> u128 {
        let w = (i128::from(self.x1) - i128::from(self.x0) + 1).max(0);
        let h = (i128::from(self.y1) - i128::from(self.y0) + 1).max(0);
        u128::try_from(w.saturating_mul(h)).unwrap_or(0)
    }

    fn contains(&self, (x, y): CellKey) -> bool {
        self.x0 <= x && x <= self.x1 && self.y0 <= y && y <= self.y1
    }

    fn cells(self) -> impl Iterator<Item = CellKey> {
        (self.y0..=self.y1).flat_map(move |y| (self.x0..=self.x1).map(move |x| (x, y)))
    }
}

/// An overflow entry that was moved to a new slot by a swap-remove.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct OverflowMove {
    /// Dirty-list index of the element that moved.
    pub(crate) dirty_index: usize,
    /// Its new overflow slot.
    pub(crate) slot: usize,
}

/// Outcome of [`DirtyGrid::update`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct GridUpdate {
    /// The element's overflow slot after the update, if it is in overflow.
    pub(crate) overflow: Option<usize>,
    /// Another element whose overflow slot changed as a side effect.
    pub(crate) moved: Option<OverflowMove>,
}

pub(crate) struct DirtyGrid {
    config: DirtyGridConfig,
    cells: HashMap<CellKey, Vec<usize>>,
    /// Overflowed dirty indices by slot; slots are back-referenced from the directory.
    overflow: Vec<usize>,
    /// The same indices kept ascending, ready to merge with cell lists.
    overflow_sorted: Vec<usize>,
}

impl DirtyGrid {
    pub(crate) fn new(config: DirtyGridConfig) -> Self {
        Self {
            config,
            cells: HashMap::new(),
            overflow: Vec::new(),
            overflow_sorted: Vec::new(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    pub(crate) fn clear(&mut self) {
        self.cells.clear();
        self.overflow.clear();
        self.overflow_sorted.clear();
    }

    pub(crate) fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    pub(crate) fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn floor_to_i64(v: f64) -> i64 {
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Saturating float-to-int casts are the intended behavior for far-away coordinates."
        )]
        let i = v as i64;
        if (i as f64) > v { i.saturating_sub(1) } else { i }
    }

    fn key_for(&self, p: Point) -> CellKey {
        let s = self.config.cell_size;
        debug_assert!(s > 0.0, "cell size must be positive");
        (Self::floor_to_i64(p.x / s), Self::floor_to_i64(p.y / s))
    }

    fn range_for(&self, footprint: Rect) -> CellRange {
        let (x0, y0) = self.key_for(Point::new(footprint.x0, footprint.y0));
        let (x1, y1) = self.key_for(Point::new(footprint.x1, footprint.y1));
        CellRange { x0, y0, x1, y1 }
    }

    /// Whether an element covering `range` can be stored in cells.
    ///
    /// Cells in `already_in` are ones the element occupies already and do not
    /// need spare capacity.
    fn fits(&self, range: &CellRange, already_in: Option<&CellRange>) -> bool {
        if range.count() > self.config.max_cells_per_element as u128 {
            return false;
        }
        range.cells().all(|key| {
            if already_in.is_some_and(|r| r.contains(key)) {
                return true;
            }
            self.cells
                .get(&key)
                .is_none_or(|slots| slots.len() < self.config.cell_capacity)
        })
    }

    fn insert_into_cell(&mut self, key: CellKey, dirty_index: usize) {
        let slots = self.cells.entry(key).or_default();
        if let Err(pos) = slots.binary_search(&dirty_index) {
            slots.insert(pos, dirty_index);
        }
    }

    fn remove_from_cell(&mut self, key: CellKey, dirty_index: usize) {
        let Some(slots) = self.cells.get_mut(&key) else {
            debug_assert!(false, "dirty element missing from cell {key:?}");
            return;
        };
        if let Ok(pos) = slots.binary_search(&dirty_index) {
            slots.remove(pos);
        } else {
            debug_assert!(false, "dirty element missing from cell {key:?}");
        }
        if slots.is_empty() {
            self.cells.remove(&key);
        }
    }

    fn push_overflow(&mut self, dirty_index: usize) -> usize {
        self.overflow.push(dirty_index);
        self.insert_sorted_overflow(dirty_index);
        self.overflow.len() - 1
    }

    fn insert_sorted_overflow(&mut self, dirty_index: usize) {
        if let Err(pos) = self.overflow_sorted.binary_search(&dirty_index) {
            self.overflow_sorted.insert(pos, dirty_index);
        }
    }

    fn remove_sorted_overflow(&mut self, dirty_index: usize) {
        if let Ok(pos) = self.overflow_sorted.binary_search(&dirty_index) {
            self.overflow_sorted.remove(pos);
        } else {
            debug_assert!(false, "overflow views disagree on {dirty_index}");
        }
    }

    fn remove_overflow(&mut self, slot: usize) -> Option<OverflowMove> {
        assert!(
            slot < self.overflow.len(),
            "overflow slot {slot} out of range ({})",
            self.overflow.len()
        );
        let dirty_index = self.overflow.swap_remove(slot);
        self.remove_sorted_overflow(dirty_index);
        self.overflow.get(slot).map(|&dirty_index| OverflowMove { dirty_index, slot })
    }

    /// Register a new dirty element. Returns its overflow slot if the grid could not place it.
    pub(crate) fn add(&mut self, bounds: &Aabb3D, dirty_index: usize) -> Option<usize> {
        if !self.is_enabled() {
            return None;
        }
        let range = self.range_for(bounds.footprint());
        if self.fits(&range, None) {
            for key in range.cells() {
                self.insert_into_cell(key, dirty_index);
            }
            None
        } else {
            Some(self.push_overflow(dirty_index))
        }
    }

    /// Move a dirty element from `old` to `new` bounds.
    ///
    /// Only the cells that differ are touched. If the new placement does not fit,
    /// the element leaves every cell and goes to overflow as a whole.
    pub(crate) fn update(
        &mut self,
        old: &Aabb3D,
        new: &Aabb3D,
        dirty_index: usize,
        overflow: Option<usize>,
    ) -> GridUpdate {
        if !self.is_enabled() {
            return GridUpdate {
                overflow: None,
                moved: None,
            };
        }
        let new_range = self.range_for(new.footprint());
        match overflow {
            Some(slot) => {
                if self.fits(&new_range, None) {
                    let moved = self.remove_overflow(slot);
                    for key in new_range.cells() {
                        self.insert_into_cell(key, dirty_index);
                    }
                    GridUpdate {
                        overflow: None,
                        moved,
                    }
                } else {
                    GridUpdate {
                        overflow: Some(slot),
                        moved: None,
                    }
                }
            }
            None => {
                let old_range = self.range_for(old.footprint());
                if old_range == new_range {
                    return GridUpdate {
                        overflow: None,
                        moved: None,
                    };
                }
                if self.fits(&new_range, Some(&old_range)) {
                    for key in old_range.cells().filter(|k| !new_range.contains(*k)) {
                        self.remove_from_cell(key, dirty_index);
                    }
                    for key in new_range.cells().filter(|k| !old_range.contains(*k)) {
                        self.insert_into_cell(key, dirty_index);
                    }
                    GridUpdate {
                        overflow: None,
                        moved: None,
                    }
                } else {
                    for key in old_range.cells() {
                        self.remove_from_cell(key, dirty_index);
                    }
                    GridUpdate {
                        overflow: Some(self.push_overflow(dirty_index)),
                        moved: None,
                    }
                }
            }
        }
    }

    /// Forget a dirty element.
    pub(crate) fn remove(
        &mut self,
        bounds: &Aabb3D,
        dirty_index: usize,
        overflow: Option<usize>,
    ) -> Option<OverflowMove> {
        if !self.is_enabled() {
            return None;
        }
        match overflow {
            Some(slot) => self.remove_overflow(slot),
            None => {
                for key in self.range_for(bounds.footprint()).cells() {
                    self.remove_from_cell(key, dirty_index);
                }
                None
            }
        }
    }

    /// Rename a dirty element that was swapped from index `from` into `to`.
    pub(crate) fn relocate(
        &mut self,
        bounds: &Aabb3D,
        from: usize,
        to: usize,
        overflow: Option<usize>,
    ) {
        if !self.is_enabled() {
            return;
        }
        match overflow {
            Some(slot) => {
                debug_assert_eq!(self.overflow[slot], from, "stale overflow back-reference");
                self.overflow[slot] = to;
                self.remove_sorted_overflow(from);
                self.insert_sorted_overflow(to);
            }
            None => {
                for key in self.range_for(bounds.footprint()).cells() {
                    self.remove_from_cell(key, from);
                    self.insert_into_cell(key, to);
                }
            }
        }
    }

    /// Dirty indices that may overlap `footprint`, ascending and de-duplicated.
    ///
    /// Returns `None` when the grid is disabled or the query touches too many cells;
    /// the caller then scans the dirty list linearly.
    pub(crate) fn query_rect(&self, footprint: Rect) -> Option<Vec<usize>> {
        if !self.is_enabled() {
            return None;
        }
        let range = self.range_for(footprint);
        if range.count() > self.config.max_query_cells as u128 {
            tracing::trace!(cells = %range.count(), "dirty grid bypassed for box query");
            return None;
        }
        Some(self.merge_cells(range.cells()))
    }

    /// Dirty indices that may overlap the segment `start..end` widened by `half_extents`.
    ///
    /// Cells are found by walking the segment through the grid, so long diagonal
    /// rays only touch the cells they cross.
    pub(crate) fn query_segment(
        &self,
        start: Point,
        end: Point,
        half_extents: Vec2,
    ) -> Option<Vec<usize>> {
        if !self.is_enabled() {
            return None;
        }
        let cells = self.segment_cells(start, end, half_extents);
        if cells.is_none() {
            tracing::trace!("dirty grid bypassed for segment query");
        }
        Some(self.merge_cells(cells?.into_iter()))
    }

    fn segment_cells(&self, start: Point, end: Point, half_extents: Vec2) -> Option<BTreeSet<CellKey>> {
        let s = self.config.cell_size;
        let limit = self.config.max_query_cells;
        let pad_x = Self::floor_to_i64((half_extents.x / s).ceil()).max(0);
        let pad_y = Self::floor_to_i64((half_extents.y / s).ceil()).max(0);
        if (2 * i128::from(pad_x) + 1).saturating_mul(2 * i128::from(pad_y) + 1) > limit as i128 {
            return None;
        }
        let mut out = BTreeSet::new();
        let visit = |out: &mut BTreeSet<CellKey>, (x, y): CellKey| -> bool {
            for dy in -pad_y..=pad_y {
                for dx in -pad_x..=pad_x {
                    out.insert((x.saturating_add(dx), y.saturating_add(dy)));
                }
            }
            out.len() <= limit
        };

        let (mut cx, mut cy) = self.key_for(start);
        let last = self.key_for(end);
        if !visit(&mut out, last) {
            return None;
        }
        let d = end - start;
        let step_x = Self::step(d.x);
        let step_y = Self::step(d.y);
        loop {
            if !visit(&mut out, (cx, cy)) {
                return None;
            }
            let t_x = Self::crossing(start.x, d.x, cx, s);
            let t_y = Self::crossing(start.y, d.y, cy, s);
            if (cx, cy) == last || t_x.min(t_y) > 1.0 + CORNER_TOLERANCE {
                break;
            }
            if (t_x - t_y).abs() <= CORNER_TOLERANCE {
                // Through a corner (up to rounding): the point on the corner belongs
                // to a side cell the diagonal step would skip, so take both.
                if !visit(&mut out, (cx.saturating_add(step_x), cy))
                    || !visit(&mut out, (cx, cy.saturating_add(step_y)))
                {
                    return None;
                }
                cx = cx.saturating_add(step_x);
                cy = cy.saturating_add(step_y);
            } else if t_x < t_y {
                cx = cx.saturating_add(step_x);
            } else {
                cy = cy.saturating_add(step_y);
            }
        }
        Some(out)
    }

    fn step(delta: f64) -> i64 {
        if delta > 0.0 {
            1
        } else if delta < 0.0 {
            -1
        } else {
            0
        }
    }

    /// Segment parameter, normalized so the segment spans `[0, 1]`, at which the
    /// walk leaves `cell` along one axis. Recomputed from the boundary each step so
    /// rounding does not accumulate.
    fn crossing(origin: f64, delta: f64, cell: i64, s: f64) -> f64 {
        if delta > 0.0 {
            ((cell as f64 + 1.0) * s - origin) / delta
        } else if delta < 0.0 {
            (cell as f64 * s - origin) / delta
        } else {
            f64::INFINITY
        }
    }

    fn merge_cells(&self, keys: impl Iterator<Item = CellKey>) -> Vec<usize> {
        let mut lists: Vec<&[usize]> = keys
            .filter_map(|key| self.cells.get(&key).map(Vec::as_slice))
            .collect();
        lists.push(&self.overflow_sorted);
        merge_sorted(&lists)
    }

    #[cfg(test)]
    pub(crate) fn cells_of(&self, dirty_index: usize) -> Vec<CellKey> {
        let mut keys: Vec<_> = self
            .cells
            .iter()
            .filter(|(_, slots)| slots.binary_search(&dirty_index).is_ok())
            .map(|(k, _)| *k)
            .collect();
        keys.sort_unstable();
        keys
    }

    #[cfg(test)]
    pub(crate) fn expected_cells(&self, bounds: &Aabb3D) -> Vec<CellKey> {
        let mut keys: Vec<_> = self.range_for(bounds.footprint()).cells().collect();
        keys.sort_unstable();
        keys
    }

    #[cfg(test)]
    pub(crate) fn overflow_slot_of(&self, dirty_index: usize) -> Option<usize> {
        let mut sorted = self.overflow.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, self.overflow_sorted, "sorted overflow view is stale");
        self.overflow.iter().position(|&i| i == dirty_index)
    }
}

/// K-way merge of ascending lists into one ascending list without duplicates.
fn merge_sorted(lists: &[&[usize]]) -> Vec<usize> {
    let mut heap = BinaryHeap::with_capacity(lists.len());
    for (list, slots) in lists.iter().enumerate() {
        if let Some(&first) = slots.first() {
            heap.push(Reverse((first, list, 0_usize)));
        }
    }
    let mut out = Vec::new();
    while let Some(Reverse((value, list, pos))) = heap.pop() {
        if out.last() != Some(&value) {
            out.push(value);
        }
        if let Some(&next) = lists[list].get(pos + 1) {
            heap.push(Reverse((next, list, pos + 1)));
        }
    }
    out
}

impl Debug for DirtyGrid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirtyGrid")
            .field("cell_size", &self.config.cell_size)
            .field("cells", &self.cells.len())
            .field("overflow", &self.overflow.len())
            .finish_non_exhaustive()
    }
}
