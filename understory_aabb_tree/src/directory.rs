// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Payload directory: O(1) lookup from a payload to where it currently lives.

use core::fmt::Debug;
use core::hash::Hash;
use std::collections::HashMap;

/// Where a payload is stored.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// In the tree leaf with this index.
    Leaf(usize),
    /// At this index of the dirty list.
    Dirty(usize),
    /// At this index of the global list.
    Global(usize),
    /// Waiting in a build's work stack; not yet assigned to a leaf.
    Unplaced,
}

/// Per-payload bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PayloadInfo {
    pub(crate) location: Location,
    /// Slot in the dirty grid's overflow list, for dirty elements the grid could not place.
    pub(crate) overflow: Option<usize>,
}

impl PayloadInfo {
    pub(crate) const fn at(location: Location) -> Self {
        Self {
            location,
            overflow: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct PayloadDirectory<P> {
    entries: HashMap<P, PayloadInfo>,
}

impl<P: Copy + Eq + Hash> PayloadDirectory<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, payload: &P) -> Option<PayloadInfo> {
        self.entries.get(payload).copied()
    }

    pub(crate) fn contains(&self, payload: &P) -> bool {
        self.entries.contains_key(payload)
    }

    pub(crate) fn set(&mut self, payload: P, info: PayloadInfo) {
        self.entries.insert(payload, info);
    }

    pub(crate) fn set_location(&mut self, payload: &P, location: Location) {
        let info = self.entries.get_mut(payload);
        debug_assert!(info.is_some(), "relocating an untracked payload");
        if let Some(info) = info {
            info.location = location;
        }
    }

    pub(crate) fn set_overflow(&mut self, payload: &P, overflow: Option<usize>) {
        let info = self.entries.get_mut(payload);
        debug_assert!(info.is_some(), "overflow slot for an untracked payload");
        if let Some(info) = info {
            info.overflow = overflow;
        }
    }

    pub(crate) fn remove(&mut self, payload: &P) -> Option<PayloadInfo> {
        self.entries.remove(payload)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&P, &PayloadInfo)> {
        self.entries.iter()
    }
}

impl<P: Copy + Eq + Hash> Default for PayloadDirectory<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Debug for PayloadDirectory<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PayloadDirectory")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
