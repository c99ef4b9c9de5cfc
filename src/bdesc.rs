//! Block descriptors: in-memory handles to a single disk block.
//!
//! A small struct wrapping a byte buffer behind a cheap handle, stored in a
//! `slotmap::SlotMap` arena rather than behind `Arc`/`Rc` so the engine can
//! hand out stable, bounds-checked handles instead of raw pointers into a
//! linked list.

use std::collections::HashSet;

use slotmap::new_key_type;

use crate::patch::PatchId;
use crate::types::{BlockNumber, GraphIndex, Level};

new_key_type! {
    /// Stable handle to a [`Bdesc`] held in an [`crate::engine::Engine`]'s arena.
    pub struct BdescId;
}

/// In-memory handle to a specific disk block.
pub struct Bdesc {
    /// Block number on the owning device's address space.
    pub number: BlockNumber,
    /// Length in bytes; always a multiple of the owning BD's `block_size`.
    pub length: usize,
    /// The block's data buffer.
    pub data: Box<[u8]>,
    /// Number of live retains (callers holding a reference, plus one while
    /// any patch references this block).
    pub ref_count: u32,
    /// Number of retains registered for release at the next autorelease
    /// sweep, used for EMPTY patches and other transient bdesc references.
    pub autorelease_count: u32,
    /// True until the buffer has been populated from disk (or written to).
    pub synthetic: bool,
    /// True while the block's clean image is in flight to the layer below
    /// and awaiting a landing acknowledgement.
    pub in_flight: bool,
    /// All patches currently attached to this block, in creation order
    /// (oldest first; iterate `.rev()` for newest-first walks).
    pub all_patches: Vec<PatchId>,
    /// `ready_patches[level]`: patches on this block with no before at
    /// their own level or higher, indexed by level.
    ready_patches: Vec<HashSet<PatchId>>,
    /// `index_patches[graph_index]`: patches on this block owned by the BD
    /// at `graph_index`, so a revision tail or slice can find "my patches
    /// on this block" without scanning every patch on it.
    index_patches: Vec<HashSet<PatchId>>,
}

impl Bdesc {
    /// Allocates a new, synthetic (unpopulated) block descriptor.
    pub fn synthetic(number: BlockNumber, length: usize) -> Self {
        Self {
            number,
            length,
            data: vec![0u8; length].into_boxed_slice(),
            ref_count: 0,
            autorelease_count: 0,
            synthetic: true,
            in_flight: false,
            all_patches: Vec::new(),
            ready_patches: Vec::new(),
            index_patches: Vec::new(),
        }
    }

    /// Allocates a new block descriptor populated with data read from disk.
    pub fn from_disk(number: BlockNumber, data: Box<[u8]>) -> Self {
        Self {
            number,
            length: data.len(),
            data,
            ref_count: 0,
            autorelease_count: 0,
            synthetic: false,
            in_flight: false,
            all_patches: Vec::new(),
            ready_patches: Vec::new(),
            index_patches: Vec::new(),
        }
    }

    fn ensure_level(&mut self, level: Level) -> &mut HashSet<PatchId> {
        let idx = level as usize;
        if self.ready_patches.len() <= idx {
            self.ready_patches.resize_with(idx + 1, HashSet::new);
        }
        &mut self.ready_patches[idx]
    }

    fn ensure_index(&mut self, graph_index: GraphIndex) -> &mut HashSet<PatchId> {
        let idx = graph_index as usize;
        if self.index_patches.len() <= idx {
            self.index_patches.resize_with(idx + 1, HashSet::new);
        }
        &mut self.index_patches[idx]
    }

    /// Inserts `patch` into this block's `ready_patches[level]` set.
    pub fn link_ready(&mut self, level: Level, patch: PatchId) {
        self.ensure_level(level).insert(patch);
    }

    /// Removes `patch` from `ready_patches[level]`, if present.
    pub fn unlink_ready(&mut self, level: Level, patch: PatchId) {
        if let Some(set) = self.ready_patches.get_mut(level as usize) {
            set.remove(&patch);
        }
    }

    /// True iff `patch` currently sits in some level's ready set.
    pub fn is_ready_anywhere(&self, patch: PatchId) -> bool {
        self.ready_patches.iter().any(|set| set.contains(&patch))
    }

    /// Patches ready to move down from `level`, as required by
    /// [`crate::revision::slice_create`].
    pub fn ready_at(&self, level: Level) -> impl Iterator<Item = PatchId> + '_ {
        self.ready_patches
            .get(level as usize)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Inserts `patch` into this block's `index_patches[graph_index]` set.
    pub fn link_index(&mut self, graph_index: GraphIndex, patch: PatchId) {
        self.ensure_index(graph_index).insert(patch);
    }

    /// Removes `patch` from `index_patches[graph_index]`, if present.
    pub fn unlink_index(&mut self, graph_index: GraphIndex, patch: PatchId) {
        if let Some(set) = self.index_patches.get_mut(graph_index as usize) {
            set.remove(&patch);
        }
    }

    /// Patches on this block owned by the BD at `graph_index`, without
    /// scanning patches owned by anyone else.
    pub fn owned_by(&self, graph_index: GraphIndex) -> impl Iterator<Item = PatchId> + '_ {
        self.index_patches
            .get(graph_index as usize)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Adds `patch` to `all_patches` (newest entries are appended; iterate
    /// `.rev()` for newest-first walks during overlap attach).
    pub fn link_all(&mut self, patch: PatchId) {
        self.all_patches.push(patch);
    }

    /// Removes `patch` from `all_patches`.
    pub fn unlink_all(&mut self, patch: PatchId) {
        if let Some(pos) = self.all_patches.iter().position(|p| *p == patch) {
            self.all_patches.remove(pos);
        }
    }

    /// Patches on this block in newest-first order.
    pub fn newest_first(&self) -> impl Iterator<Item = PatchId> + '_ {
        self.all_patches.iter().rev().copied()
    }

    /// Whether this block has no more attached patches and no retains, and
    /// so may be reclaimed by its owning arena.
    pub fn is_collectible(&self) -> bool {
        self.ref_count == 0 && self.autorelease_count == 0 && self.all_patches.is_empty()
    }
}
