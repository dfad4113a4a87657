// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory AABB Tree: a dynamic 3D bounding-box tree for broad-phase queries.
//!
//! - Insert, move, and remove axis-aligned boxes tagged with caller payloads.
//! - Raycast, sweep (a moving box), and overlap queries through one visitor API.
//! - Rebuild the tree incrementally with a per-call work budget, so no single
//!   call has to pay for a full rebuild.
//!
//! Elements live in one of three tiers:
//!
//! - **Tree leaves**, placed by the most recent build.
//! - **Dirty list**, for elements updated since then. A coarse grid over the X
//!   and Y axes keeps queries against it sub-linear; elements the grid cannot
//!   place sit in an overflow list that every query checks.
//! - **Global list**, for unbounded elements and elements larger than
//!   [`TreeConfig::max_payload_bounds`]. Every query visits it.
//!
//! Once the dirty list grows past [`TreeConfig::max_dirty_elements`] the tree is
//! rebuilt from all three tiers in one synchronous pass.
//!
//! # Example
//!
//! ```rust
//! use glam::DVec3;
//! use understory_aabb_tree::{AabbTree, Aabb3D, TreeConfig};
//!
//! let boxes = (0..100_u32).map(|i| {
//!     let min = DVec3::new(f64::from(i) * 10.0, 0.0, 0.0);
//!     (i, Aabb3D::new(min, min + DVec3::ONE))
//! });
//! let mut tree = AabbTree::from_elements(TreeConfig::default(), boxes);
//!
//! // Move one box and drop another.
//! tree.update_element(7, Aabb3D::new(DVec3::splat(-5.0), DVec3::splat(-4.0)), true);
//! tree.remove_element(8);
//!
//! let hits = tree.find_all_intersections(Aabb3D::new(DVec3::ZERO, DVec3::new(95.0, 1.0, 1.0)));
//! assert_eq!(hits.len(), 8);
//!
//! let (first, toi) = tree.raycast_closest(DVec3::new(-1.0, 0.5, 0.5), DVec3::X, 1_000.0).unwrap();
//! assert_eq!((first, toi), (0, 1.0));
//! ```
//!
//! Time-sliced rebuilds keep the old structure queryable until the new one is ready:
//!
//! ```rust
//! use glam::DVec3;
//! use understory_aabb_tree::{AabbTree, Aabb3D, BuildStatus, TreeConfig};
//!
//! let config = TreeConfig { max_elements_per_build_step: 64, ..TreeConfig::default() };
//! let mut tree: AabbTree<u32> = AabbTree::new(config);
//! for i in 0..1_000 {
//!     let min = DVec3::new(f64::from(i % 40) * 3.0, f64::from(i / 40) * 3.0, 0.0);
//!     tree.update_element(i, Aabb3D::new(min, min + DVec3::ONE), true);
//! }
//! tree.begin_reoptimize();
//! while tree.progress_build(false) == BuildStatus::InProgress {
//!     // Queries still see all 1000 elements while the build runs.
//!     assert_eq!(tree.find_all_intersections(Aabb3D::FULL).len(), 1_000);
//! }
//! assert_eq!(tree.stats().dirty, 0);
//! ```
//!
//! ## Float semantics
//!
//! Bounds, origins and directions are assumed finite and free of NaN, except for
//! [`Aabb3D::FULL`], the unbounded sentinel.

mod builder;
pub mod config;
pub mod directory;
mod dirty_grid;
pub mod query;
mod store;
mod tree;
pub mod types;

#[cfg(test)]
mod testing;

pub use builder::BuildStatus;
pub use config::{DirtyGridConfig, TreeConfig};
pub use directory::Location;
pub use query::{
    Candidate, ClosestHit, CollectPayloads, Cursor, QueryShape, QueryTiers, Tier, Visitor,
};
pub use tree::{AabbTree, TreeStats};
pub use types::{Aabb3D, Element};
