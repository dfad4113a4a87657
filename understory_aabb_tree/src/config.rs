// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tuning knobs for the tree and its dirty grid.
//!
//! Every index owns its own configuration, so differently tuned trees can live
//! side by side.

/// Configuration for an [`AabbTree`](crate::AabbTree).
#[derive(Clone, Debug, PartialEq)]
pub struct TreeConfig {
    /// Soft cap on elements per leaf. Degenerate splits may exceed it.
    pub max_children_in_leaf: usize,
    /// Depth at which the builder stops splitting and emits a leaf.
    pub max_tree_depth: usize,
    /// Boxes whose longest extent exceeds this go to the global tier.
    pub max_payload_bounds: f64,
    /// Elements processed per [`progress_build`](crate::AabbTree::progress_build) call.
    pub max_elements_per_build_step: usize,
    /// Dirty tier size that triggers a synchronous reoptimize.
    pub max_dirty_elements: usize,
    /// Dirty grid tuning.
    pub dirty_grid: DirtyGridConfig,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_children_in_leaf: 8,
            max_tree_depth: 32,
            max_payload_bounds: 100_000.0,
            max_elements_per_build_step: 1_000,
            max_dirty_elements: 10_000,
            dirty_grid: DirtyGridConfig::default(),
        }
    }
}

/// Configuration for the dirty-element grid.
///
/// The grid covers the X and Y axes only. A non-positive `cell_size` or a zero
/// `max_query_cells` disables it, and every dirty query becomes a linear scan.
#[derive(Clone, Debug, PartialEq)]
pub struct DirtyGridConfig {
    /// Edge length of a square cell.
    pub cell_size: f64,
    /// Elements covering more cells than this are kept in the overflow list.
    pub max_cells_per_element: usize,
    /// A cell holding this many entries is full; new entries overflow.
    pub cell_capacity: usize,
    /// Queries touching more cells than this bypass the grid.
    pub max_query_cells: usize,
}

impl DirtyGridConfig {
    /// A configuration that turns the grid off.
    pub const fn disabled() -> Self {
        Self {
            cell_size: 0.0,
            max_cells_per_element: 0,
            cell_capacity: 0,
            max_query_cells: 0,
        }
    }

    /// Whether this configuration enables the grid.
    pub fn is_enabled(&self) -> bool {
        self.cell_size > 0.0 && self.max_query_cells > 0
    }
}

impl Default for DirtyGridConfig {
    fn default() -> Self {
        Self {
            cell_size: 1_000.0,
            max_cells_per_element: 16,
            cell_capacity: 32,
            max_query_cells: 340,
        }
    }
}
