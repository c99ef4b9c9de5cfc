//! Patches: single block modifications plus their dependency edges.

use std::collections::HashSet;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::bdesc::BdescId;
use crate::types::{BdHandle, Level};

new_key_type! {
    /// Stable handle to a [`Patch`] held in an [`crate::engine::Engine`]'s arena.
    pub struct PatchId;
}

new_key_type! {
    /// Stable handle to a weak reference slot.
    ///
    /// Kept in a separate arena from patches themselves: the slot is zeroed
    /// when its target patch is destroyed, so dereferencing a weak ref is a
    /// single bounds+tag check rather than a dangling-pointer hazard.
    pub struct WeakRefId;
}

bitflags! {
    /// Per-patch flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PatchFlags: u32 {
        /// Graph-walk scratch bit, used (and always cleared again) by the
        /// optional cycle checker.
        const MARKED        = 1 << 0;
        /// The patch's effect is currently rolled back out of its block's buffer.
        const ROLLBACK      = 1 << 1;
        /// The patch has been flushed to disk and satisfied.
        const WRITTEN       = 1 << 2;
        /// The patch is in the process of being freed.
        const FREEING       = 1 << 3;
        /// User data change, as opposed to metadata.
        const DATA          = 1 << 4;
        /// Internal marker for bit-patch merge hubs.
        const BIT_EMPTY     = 1 << 5;
        /// Fully overlaps an older patch on the same block.
        const OVERLAP       = 1 << 6;
        /// Dependency engine may assume this is a safe after without walking further.
        const SAFE_AFTER    = 1 << 7;
        /// EMPTY whose would-be afters are rewritten to depend on its befores instead.
        const SET_EMPTY     = 1 << 8;
        /// Patch has been handed to the layer below and is awaiting landing.
        const INFLIGHT      = 1 << 9;
        /// Patch is exempt from patchgroup top/bottom capture.
        const NO_PATCHGROUP = 1 << 10;
        /// Patch is overlapped by a newer patch completely.
        const FULLOVERLAP   = 1 << 11;
    }
}

/// The three patch kinds.
#[derive(Debug)]
pub enum PatchKind {
    /// Flips bits at `offset` (always length 4).
    Bit {
        /// Bits to flip via XOR.
        xor: u32,
        /// Bits touched; used for overlap checks and for merging two BIT
        /// patches at the same offset.
        or: u32,
    },
    /// Replaces `length` bytes at `offset`.
    Byte {
        /// Pre-image captured for rollback. `None` means the patch is not
        /// rollbackable (used by `create_init`-style zero-fills where no
        /// prior image is meaningful).
        pre_image: Option<Vec<u8>>,
    },
    /// A zero-effect hub patch, used for grouping (patchgroups, bit-patch
    /// merge hubs, and flattening via `SET_EMPTY`).
    Empty,
}

/// Result of [`crate::engine::Engine::overlap_check`]: a tri-state rather
/// than a bool, since a new patch can sit fully inside an older one's range
/// without the reverse being true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Disjoint byte ranges (or, for BIT patches, disjoint masks).
    None,
    /// Ranges/masks intersect but neither fully contains the other.
    Partial,
    /// The new patch's range/mask fully contains the older patch's.
    Complete,
}

/// A single block modification and its dependency edges.
pub struct Patch {
    /// The block device that created (and is responsible for writing) this
    /// patch. `None` only for a fully detached EMPTY hub that has not (or
    /// will never be) attached to a block. Invariant: `block.is_some()`
    /// implies `owner.is_some()`.
    pub owner: Option<BdHandle>,
    /// The block this patch modifies. `None` only for a detached EMPTY hub.
    pub block: Option<BdescId>,
    /// Byte offset into the block.
    pub offset: u16,
    /// Length in bytes (4 for BIT, 0 for EMPTY).
    pub length: u16,
    /// Variant payload.
    pub kind: PatchKind,
    /// Flag bitset.
    pub flags: PatchFlags,
    /// Patches that must be durable before this one.
    pub befores: HashSet<PatchId>,
    /// Patches that depend on this one being durable first.
    pub afters: HashSet<PatchId>,
    /// `nbefores[level]`: count of direct befores at each level.
    nbefores: Vec<u32>,
    /// Weak references currently pointing at this patch.
    pub(crate) weak_holders: Vec<WeakRefId>,
}

impl Patch {
    pub(crate) fn new(owner: Option<BdHandle>, block: Option<BdescId>, offset: u16, length: u16, kind: PatchKind) -> Self {
        debug_assert!(block.is_none() || owner.is_some(), "a patch attached to a block must have an owner");
        Self {
            owner,
            block,
            offset,
            length,
            kind,
            flags: PatchFlags::empty(),
            befores: HashSet::new(),
            afters: HashSet::new(),
            nbefores: Vec::new(),
            weak_holders: Vec::new(),
        }
    }

    /// Whether this patch may be rolled back: EMPTY and BIT are always
    /// rollbackable; BYTE is rollbackable iff it captured a pre-image.
    pub fn is_rollbackable(&self) -> bool {
        match &self.kind {
            PatchKind::Byte { pre_image } => pre_image.is_some(),
            PatchKind::Bit { .. } | PatchKind::Empty => true,
        }
    }

    /// `nbefores[level]`, or 0 if nothing has ever touched that level.
    pub fn nbefores_at(&self, level: Level) -> u32 {
        self.nbefores.get(level as usize).copied().unwrap_or(0)
    }

    pub(crate) fn inc_nbefores(&mut self, level: Level) {
        let idx = level as usize;
        if self.nbefores.len() <= idx {
            self.nbefores.resize(idx + 1, 0);
        }
        self.nbefores[idx] += 1;
    }

    pub(crate) fn dec_nbefores(&mut self, level: Level) {
        let idx = level as usize;
        if let Some(slot) = self.nbefores.get_mut(idx) {
            *slot = slot.saturating_sub(1);
        }
    }

    /// The maximum level among this patch's direct befores, or
    /// [`crate::types::LEVEL_NONE`] if it has none.
    pub fn max_before_level(&self) -> Level {
        for (level, count) in self.nbefores.iter().enumerate().rev() {
            if *count > 0 {
                return level as Level;
            }
        }
        crate::types::LEVEL_NONE
    }

    /// This patch's level: the owner's level, bumped by one while in
    /// flight, or (for an ownerless EMPTY) the maximum before-level.
    pub fn level(&self) -> Level {
        match self.owner {
            Some(owner) => owner.level + u32::from(self.flags.contains(PatchFlags::INFLIGHT)),
            None => self.max_before_level(),
        }
    }

    /// Whether this patch has no before at its own level or higher: the
    /// condition for membership in a block's ready-patches set. Ownerless
    /// patches are never ready: they have no block to be scheduled on.
    pub fn is_ready(&self) -> bool {
        let Some(owner) = self.owner else {
            return false;
        };
        let before_level = self.max_before_level();
        before_level == crate::types::LEVEL_NONE || before_level < owner.level
    }
}
