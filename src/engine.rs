//! The dependency engine: patch creation, dependency add/remove, level
//! propagation, overlap attach, apply/rollback/satisfy.
//!
//! One arena owns every patch and tracks its lifecycle (create → ready →
//! satisfy → reclaim). All patch-graph mutations serialize under a single
//! logical lock; callers share an `Engine` behind `SharedEngine`
//! (`Arc<parking_lot::Mutex<Engine>>`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::SlotMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::bdesc::{Bdesc, BdescId};
use crate::error::{FeatherstitchError, Result};
use crate::patch::{Overlap, Patch, PatchFlags, PatchId, PatchKind, WeakRefId};
use crate::types::{BdHandle, BlockNumber, Level};

/// Optional callback invoked when a weakly-referenced patch is satisfied
/// and the weak ref that held it is cleared.
pub type WeakCallback = Box<dyn FnMut(PatchId) + Send>;

struct WeakSlot {
    target: Option<PatchId>,
    callback: Option<WeakCallback>,
}

/// The patch-graph engine: owns every [`Patch`] and [`Bdesc`] behind stable
/// arena handles, and implements patch creation, dependency tracking, and
/// the apply/rollback/satisfy lifecycle.
///
/// Shared between a stack's block devices as a [`SharedEngine`].
pub struct Engine {
    patches: SlotMap<PatchId, Patch>,
    bdescs: SlotMap<BdescId, Bdesc>,
    weak_refs: SlotMap<WeakRefId, WeakSlot>,
    /// Patches that have been `satisfy`'d but not yet freed, in a
    /// two-phase reclaim scheme: `satisfy` detaches, `reclaim_written` frees.
    reclaim_list: Vec<PatchId>,
    /// Post-images for BYTE patches, kept alongside the patch itself so
    /// `apply` can restore a previously rolled-back patch without needing a
    /// caller-supplied buffer.
    byte_post_images: HashMap<PatchId, Vec<u8>>,
    /// Whether `add_depend` walks the before-DAG to reject cycles.
    cycle_checking: bool,
}

/// Shared handle to an [`Engine`], the way a stack of block devices is
/// expected to hold it: all patch-graph mutations serialize under a
/// single logical lock.
pub type SharedEngine = Arc<Mutex<Engine>>;

impl Engine {
    /// Creates a new, empty engine.
    pub fn new(cycle_checking: bool) -> Self {
        Self {
            patches: SlotMap::with_key(),
            bdescs: SlotMap::with_key(),
            weak_refs: SlotMap::with_key(),
            reclaim_list: Vec::new(),
            byte_post_images: HashMap::new(),
            cycle_checking,
        }
    }

    /// Wraps a fresh engine in the shared handle block devices expect.
    pub fn shared(cycle_checking: bool) -> SharedEngine {
        Arc::new(Mutex::new(Self::new(cycle_checking)))
    }

    // ---- bdesc lifecycle -------------------------------------------------

    /// Allocates a synthetic (unread) block descriptor.
    pub fn alloc_synthetic(&mut self, number: BlockNumber, length: usize) -> BdescId {
        self.bdescs.insert(Bdesc::synthetic(number, length))
    }

    /// Allocates a block descriptor already populated from disk.
    pub fn alloc_from_disk(&mut self, number: BlockNumber, data: Box<[u8]>) -> BdescId {
        self.bdescs.insert(Bdesc::from_disk(number, data))
    }

    /// Borrows a bdesc.
    pub fn bdesc(&self, id: BdescId) -> &Bdesc {
        &self.bdescs[id]
    }

    /// Mutably borrows a bdesc.
    pub fn bdesc_mut(&mut self, id: BdescId) -> &mut Bdesc {
        &mut self.bdescs[id]
    }

    /// Retains a bdesc (increments its reference count).
    pub fn retain_bdesc(&mut self, id: BdescId) {
        self.bdescs[id].ref_count += 1;
    }

    /// Releases a retain on a bdesc, freeing it from the arena if it has
    /// become collectible (no retains, no attached patches).
    pub fn release_bdesc(&mut self, id: BdescId) {
        let bdesc = &mut self.bdescs[id];
        bdesc.ref_count = bdesc.ref_count.saturating_sub(1);
        if self.bdescs[id].is_collectible() {
            self.bdescs.remove(id);
        }
    }

    // ---- patch accessors ---------------------------------------------------

    /// Borrows a patch.
    pub fn patch(&self, id: PatchId) -> &Patch {
        &self.patches[id]
    }

    /// Mutably borrows a patch.
    pub fn patch_mut(&mut self, id: PatchId) -> &mut Patch {
        &mut self.patches[id]
    }

    /// Whether `id` still refers to a live patch (useful after `satisfy`,
    /// which detaches but does not yet free).
    pub fn contains_patch(&self, id: PatchId) -> bool {
        self.patches.contains_key(id)
    }

    // ---- typed constructors ------------------------------------------------

    /// Creates a non-data EMPTY hub patch.
    pub fn create_empty(&mut self, owner: Option<BdHandle>, befores: &[PatchId]) -> Result<PatchId> {
        let patch = Patch::new(owner, None, 0, 0, PatchKind::Empty);
        let id = self.patches.insert(patch);
        for &before in befores {
            self.add_depend(id, before)?;
        }
        Ok(id)
    }

    /// Creates a BIT patch flipping `xor` at `offset` on `block`. If an
    /// existing BIT patch at the same block and offset has no intervening
    /// afters, the two are merged by combining their `or` masks instead of
    /// allocating a new patch. A performance optimization, not a semantic
    /// guarantee.
    pub fn create_bit(
        &mut self,
        block: BdescId,
        owner: BdHandle,
        offset: u16,
        xor: u32,
        befores: &[PatchId],
    ) -> Result<PatchId> {
        if let Some(existing) = self.find_mergeable_bit(block, offset, xor) {
            if let PatchKind::Bit { xor: exor, or: eor } = &mut self.patches[existing].kind {
                *exor ^= xor;
                *eor |= xor;
            }
            self.apply_bits(existing, block, xor)?;
            for &before in befores {
                self.add_depend(existing, before)?;
            }
            return Ok(existing);
        }

        let patch = Patch::new(Some(owner), Some(block), offset, 4, PatchKind::Bit { xor, or: xor });
        let id = self.patches.insert(patch);
        self.bdescs[block].link_all(id);
        self.bdescs[block].link_index(owner.graph_index, id);
        for &before in befores {
            self.add_depend(id, before)?;
        }
        self.overlap_attach(id, block)?;
        self.apply_bits(id, block, xor)?;
        self.update_ready(id);
        Ok(id)
    }

    /// Finds an existing, still-malleable BIT patch at `offset` this new
    /// write could be folded into instead of creating a separate patch.
    ///
    /// Merging only makes sense when the two would otherwise need a
    /// dependency edge anyway, i.e. their masks overlap (two BIT patches
    /// at the same offset overlap iff `a.or & b.or != 0`). Two BIT patches
    /// touching disjoint bits never merge: they have no overlap edge
    /// between them regardless, so folding one into the other would only
    /// lose information.
    fn find_mergeable_bit(&self, block: BdescId, offset: u16, xor: u32) -> Option<PatchId> {
        for candidate in self.bdescs[block].newest_first() {
            let patch = &self.patches[candidate];
            if patch.flags.contains(PatchFlags::WRITTEN) {
                continue;
            }
            if let PatchKind::Bit { or, .. } = patch.kind {
                if patch.offset == offset && patch.afters.is_empty() && or & xor != 0 {
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn apply_bits(&mut self, id: PatchId, block: BdescId, xor: u32) -> Result<()> {
        let patch = &self.patches[id];
        let (offset, length) = (patch.offset as usize, patch.length as usize);
        let data = &mut self.bdescs[block].data;
        let slice = data
            .get_mut(offset..offset + length)
            .ok_or_else(|| FeatherstitchError::InvalidArgument("bit patch out of block bounds".into()))?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(slice);
        let value = u32::from_le_bytes(bytes) ^ xor;
        slice.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Creates a BYTE patch replacing `length` bytes at `offset` with
    /// `data` (or zeros, if `data` is `None`). The pre-image is captured
    /// for rollback unless `rollbackable` is false (used by
    /// [`Engine::create_init`]).
    fn create_byte_inner(
        &mut self,
        block: BdescId,
        owner: BdHandle,
        offset: u16,
        length: u16,
        data: Option<&[u8]>,
        rollbackable: bool,
        befores: &[PatchId],
    ) -> Result<PatchId> {
        let (offset_us, length_us) = (offset as usize, length as usize);
        if length_us > self.bdescs[block].length || offset_us + length_us > self.bdescs[block].length {
            return Err(FeatherstitchError::InvalidArgument(
                "byte patch exceeds block length".into(),
            ));
        }

        let pre_image = if rollbackable {
            Some(self.bdescs[block].data[offset_us..offset_us + length_us].to_vec())
        } else {
            None
        };
        let post_image = match data {
            Some(bytes) => bytes.to_vec(),
            None => vec![0u8; length_us],
        };

        let patch = Patch::new(
            Some(owner),
            Some(block),
            offset,
            length,
            PatchKind::Byte { pre_image },
        );
        let id = self.patches.insert(patch);
        self.byte_post_images.insert(id, post_image.clone());

        self.bdescs[block].link_all(id);
        self.bdescs[block].link_index(owner.graph_index, id);
        for &before in befores {
            self.add_depend(id, before)?;
        }
        self.overlap_attach(id, block)?;
        self.bdescs[block].data[offset_us..offset_us + length_us].copy_from_slice(&post_image);
        self.update_ready(id);
        Ok(id)
    }

    /// Creates a BYTE patch replacing `length` bytes at `offset`.
    pub fn create_byte(
        &mut self,
        block: BdescId,
        owner: BdHandle,
        offset: u16,
        length: u16,
        data: Option<&[u8]>,
        befores: &[PatchId],
    ) -> Result<PatchId> {
        self.create_byte_inner(block, owner, offset, length, data, true, befores)
    }

    /// Like [`Engine::create_byte`], but guarantees a single patch (no
    /// splitting). Since this engine never splits BYTE patches, it is
    /// identical to `create_byte`; kept as a distinct entry point so
    /// callers that rely on "exactly one patch, exactly one debug-trace
    /// event" have a name that documents the guarantee.
    pub fn create_byte_atomic(
        &mut self,
        block: BdescId,
        owner: BdHandle,
        offset: u16,
        length: u16,
        data: Option<&[u8]>,
        befores: &[PatchId],
    ) -> Result<PatchId> {
        self.create_byte(block, owner, offset, length, data, befores)
    }

    /// Creates a whole-block zero-fill patch marked not rollbackable, used
    /// by block-allocate paths where there is no meaningful pre-image to
    /// restore to.
    pub fn create_init(&mut self, block: BdescId, owner: BdHandle, befores: &[PatchId]) -> Result<PatchId> {
        let length = self.bdescs[block].length as u16;
        self.create_byte_inner(block, owner, 0, length, None, false, befores)
    }

    /// Creates a whole-block patch with provided data.
    pub fn create_full(&mut self, block: BdescId, owner: BdHandle, data: &[u8], befores: &[PatchId]) -> Result<PatchId> {
        let length = self.bdescs[block].length as u16;
        self.create_byte_inner(block, owner, 0, length, Some(data), true, befores)
    }

    // ---- dependency add/remove ---------------------------------------------

    /// Adds a dependency edge: `after` must not reach disk before `before`.
    pub fn add_depend(&mut self, after: PatchId, before: PatchId) -> Result<()> {
        if after == before {
            return Err(FeatherstitchError::InvalidArgument(
                "a patch cannot depend on itself".into(),
            ));
        }

        if self.cycle_checking && self.has_before(before, after) {
            warn!(?after, ?before, "rejected dependency: would create a cycle");
            self.unmark_all();
            return Err(FeatherstitchError::CycleDetected);
        }

        // SET_EMPTY flattening: redirect the edge through `before`'s own
        // befores rather than depending on it directly.
        if self.patches[before].flags.contains(PatchFlags::SET_EMPTY) {
            let flattened: Vec<PatchId> = self.patches[before].befores.iter().copied().collect();
            for flattened_before in flattened {
                self.add_depend(after, flattened_before)?;
            }
            return Ok(());
        }

        if self.patches[after].befores.contains(&before) {
            return Ok(());
        }

        self.patches[after].befores.insert(before);
        self.patches[before].afters.insert(after);

        let before_level = self.patches[before].level();
        let old_level = self.patches[after].level();
        self.patches[after].inc_nbefores(before_level);
        let new_level = self.patches[after].level();

        self.update_ready(after);
        if old_level != new_level {
            self.propagate_level_change(after, old_level, new_level);
        }
        Ok(())
    }

    /// Removes a dependency edge. O(1) given the two patch ids.
    pub fn remove_depend(&mut self, after: PatchId, before: PatchId) -> Result<()> {
        if !self.patches[after].befores.remove(&before) {
            return Ok(());
        }
        self.patches[before].afters.remove(&after);

        let before_level = self.patches[before].level();
        let old_level = self.patches[after].level();
        self.patches[after].dec_nbefores(before_level);
        let new_level = self.patches[after].level();

        self.update_ready(after);
        if old_level != new_level {
            self.propagate_level_change(after, old_level, new_level);
        }
        Ok(())
    }

    /// BFS over `p`'s afters, re-deriving `level()` and moving patches
    /// between ready lists as it changes. Keyed on `level()` rather than
    /// `max_before_level()`: an owned patch's level is fixed at its
    /// owner's (plus one in flight) and never moves just because its
    /// befores changed, so propagation must stop there rather than
    /// following a before-level bookkeeping change that isn't a real level
    /// change. Only an ownerless EMPTY (whose level *is* its
    /// `max_before_level`) actually needs its afters revisited. The graph
    /// is a DAG so each edge is visited at most once.
    pub(crate) fn propagate_level_change(&mut self, p: PatchId, old_level: Level, new_level: Level) {
        let mut queue: Vec<PatchId> = self.patches[p].afters.iter().copied().collect();
        let mut visited: HashSet<PatchId> = HashSet::new();

        while let Some(a) = queue.pop() {
            if !visited.insert(a) {
                continue;
            }
            let old_a_level = self.patches[a].level();
            self.patches[a].dec_nbefores(old_level);
            self.patches[a].inc_nbefores(new_level);
            let new_a_level = self.patches[a].level();

            self.update_ready(a);

            if old_a_level != new_a_level {
                queue.extend(self.patches[a].afters.iter().copied());
            }
        }
    }

    /// Marks a EMPTY patch as a hub whose would-be afters should instead
    /// depend transitively on its own befores.
    pub fn set_empty_declare(&mut self, id: PatchId) {
        self.patches[id].flags.insert(PatchFlags::SET_EMPTY);
    }

    pub(crate) fn update_ready(&mut self, id: PatchId) {
        let Some(block) = self.patches[id].block else {
            return;
        };
        let level = match self.patches[id].owner {
            Some(owner) => owner.level,
            None => return,
        };
        let is_ready = self.patches[id].is_ready();
        let currently_ready = self.bdescs[block].is_ready_anywhere(id);
        if is_ready && !currently_ready {
            self.bdescs[block].link_ready(level, id);
        } else if !is_ready && currently_ready {
            self.bdescs[block].unlink_ready(level, id);
        }
    }

    /// Walks the before-DAG rooted at `start`, marking visited patches,
    /// looking for `needle`. The optional cycle check.
    fn has_before(&mut self, start: PatchId, needle: PatchId) -> bool {
        let mut stack = vec![start];
        let mut found = false;
        while let Some(p) = stack.pop() {
            if self.patches[p].flags.contains(PatchFlags::MARKED) {
                continue;
            }
            self.patches[p].flags.insert(PatchFlags::MARKED);
            if p == needle {
                found = true;
                break;
            }
            stack.extend(self.patches[p].befores.iter().copied());
        }
        found
    }

    fn unmark_all(&mut self) {
        for (_, patch) in self.patches.iter_mut() {
            patch.flags.remove(PatchFlags::MARKED);
        }
    }

    // ---- overlap attach -----------------------------------------------------

    /// Compares two patches for overlap. Returns a tri-state result rather
    /// than a bool, since a new patch can sit fully inside an older one's
    /// range without the reverse being true.
    pub fn overlap_check(&self, a: PatchId, b: PatchId) -> Overlap {
        let pa = &self.patches[a];
        let pb = &self.patches[b];

        if pa.offset >= pb.offset + pb.length || pb.offset >= pa.offset + pa.length {
            return Overlap::None;
        }

        if let (PatchKind::Bit { or: or_a, .. }, PatchKind::Bit { or: or_b, .. }) = (&pa.kind, &pb.kind) {
            let shared = or_a & or_b;
            if shared == 0 {
                return Overlap::None;
            }
            return if shared == *or_b { Overlap::Complete } else { Overlap::Partial };
        }

        if pa.offset <= pb.offset && pa.offset + pa.length >= pb.offset + pb.length {
            Overlap::Complete
        } else {
            Overlap::Partial
        }
    }

    /// Installs overlap dependencies for a newly created patch against the
    /// existing patches on its block, walked newest-first.
    fn overlap_attach(&mut self, new_patch: PatchId, block: BdescId) -> Result<()> {
        // Most blocks carry a handful of live patches at once, so a small
        // inline buffer avoids a heap allocation on the common path.
        let candidates: SmallVec<[PatchId; 8]> = self.bdescs[block]
            .newest_first()
            .filter(|&p| p != new_patch)
            .collect();

        for older in candidates {
            match self.overlap_check(new_patch, older) {
                Overlap::None => continue,
                Overlap::Partial => {
                    self.add_depend(new_patch, older)?;
                }
                Overlap::Complete => {
                    self.add_depend(new_patch, older)?;
                    self.patches[older].flags.insert(PatchFlags::OVERLAP);
                    self.patches[new_patch].flags.insert(PatchFlags::FULLOVERLAP);
                }
            }
        }
        Ok(())
    }

    // ---- apply / rollback / satisfy ----------------------------------------

    /// Re-applies a rolled-back patch's effect to its block's buffer.
    pub fn apply(&mut self, id: PatchId) -> Result<()> {
        let block = self.patches[id].block.ok_or_else(|| {
            FeatherstitchError::InvalidArgument("cannot apply a detached patch".into())
        })?;
        let (offset, length) = (self.patches[id].offset as usize, self.patches[id].length as usize);

        match &self.patches[id].kind {
            PatchKind::Empty => {}
            PatchKind::Bit { xor, .. } => {
                let xor = *xor;
                self.apply_bits(id, block, xor)?;
            }
            PatchKind::Byte { .. } => {
                let post = self
                    .byte_post_images
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| FeatherstitchError::InvalidArgument("missing post-image".into()))?;
                self.bdescs[block].data[offset..offset + length].copy_from_slice(&post);
            }
        }
        self.patches[id].flags.remove(PatchFlags::ROLLBACK);
        Ok(())
    }

    /// Rolls back a patch's effect, restoring its block buffer to the
    /// pre-image. Rolling back a non-rollbackable BYTE patch is a
    /// programming error, detected and rejected here.
    pub fn rollback(&mut self, id: PatchId) -> Result<()> {
        if !self.patches[id].is_rollbackable() {
            return Err(FeatherstitchError::InvalidArgument(
                "attempted to roll back a non-rollbackable patch".into(),
            ));
        }
        let block = self.patches[id].block.ok_or_else(|| {
            FeatherstitchError::InvalidArgument("cannot roll back a detached patch".into())
        })?;
        let (offset, length) = (self.patches[id].offset as usize, self.patches[id].length as usize);

        match &self.patches[id].kind {
            PatchKind::Empty => {}
            PatchKind::Bit { xor, .. } => {
                let xor = *xor;
                self.apply_bits(id, block, xor)?;
            }
            PatchKind::Byte { pre_image } => {
                let pre = pre_image.clone().expect("checked rollbackable above");
                self.bdescs[block].data[offset..offset + length].copy_from_slice(&pre);
            }
        }
        self.patches[id].flags.insert(PatchFlags::ROLLBACK);
        Ok(())
    }

    /// Satisfies a patch: asserts it has no remaining befores, detaches it
    /// from every after's before-list (possibly making those patches
    /// ready), marks it `WRITTEN`, unlinks it from its block, and queues it
    /// for reclamation.
    pub fn satisfy(&mut self, id: PatchId) -> Result<()> {
        if !self.patches[id].befores.is_empty() {
            return Err(FeatherstitchError::InvalidArgument(
                "cannot satisfy a patch with remaining befores".into(),
            ));
        }

        let afters: Vec<PatchId> = self.patches[id].afters.iter().copied().collect();
        for after in afters {
            self.remove_depend(after, id)?;
        }

        self.patches[id].flags.insert(PatchFlags::WRITTEN);

        if let Some(block) = self.patches[id].block {
            let owner = self.patches[id].owner;
            self.bdescs[block].unlink_all(id);
            if let Some(owner) = owner {
                self.bdescs[block].unlink_ready(owner.level, id);
                self.bdescs[block].unlink_index(owner.graph_index, id);
            }
        }

        self.clear_weak_refs(id);
        self.reclaim_list.push(id);
        Ok(())
    }

    /// Frees every patch queued by [`Engine::satisfy`] since the last call.
    pub fn reclaim_written(&mut self) {
        let count = self.reclaim_list.len();
        for id in self.reclaim_list.drain(..) {
            self.patches.remove(id);
            self.byte_post_images.remove(&id);
        }
        if count > 0 {
            debug!(count, "reclaimed written patches");
        }
    }

    fn clear_weak_refs(&mut self, id: PatchId) {
        let holders = std::mem::take(&mut self.patches[id].weak_holders);
        for weak_id in holders {
            if let Some(slot) = self.weak_refs.get_mut(weak_id) {
                slot.target = None;
                if let Some(callback) = &mut slot.callback {
                    callback(id);
                }
            }
        }
    }

    // ---- weak references ----------------------------------------------------

    /// Creates a weak reference to `patch`, optionally invoked when the
    /// patch is satisfied.
    pub fn weak_retain(&mut self, patch: PatchId, callback: Option<WeakCallback>) -> WeakRefId {
        let weak_id = self.weak_refs.insert(WeakSlot {
            target: Some(patch),
            callback,
        });
        self.patches[patch].weak_holders.push(weak_id);
        weak_id
    }

    /// Drops a weak reference without invoking its callback.
    pub fn weak_release(&mut self, weak: WeakRefId) {
        if let Some(slot) = self.weak_refs.remove(weak) {
            if let Some(target) = slot.target {
                if let Some(patch) = self.patches.get_mut(target) {
                    patch.weak_holders.retain(|&w| w != weak);
                }
            }
        }
    }

    /// Dereferences a weak reference, returning `None` if the target has
    /// already been satisfied and cleared.
    pub fn weak_get(&self, weak: WeakRefId) -> Option<PatchId> {
        self.weak_refs.get(weak).and_then(|slot| slot.target)
    }

    /// Total number of live patches, for diagnostics/tests.
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("patches", &self.patches.len())
            .field("bdescs", &self.bdescs.len())
            .field("pending_reclaim", &self.reclaim_list.len())
            .finish()
    }
}
