//! Patchgroups: the application-facing grouping API.
//!
//! A handle that borrows the engine, moves through a small state machine,
//! and is consumed by `release`/`abandon` rather than dropped silently.
//! Dropping one still "active" (engaged, with no `tail_keep` release) is a
//! programming error.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};
use thiserror::Error;
use tracing::debug;

use crate::engine::SharedEngine;
use crate::error::FeatherstitchError;
use crate::patch::PatchId;

new_key_type! {
    /// Stable handle to a [`Patchgroup`] within a [`PatchgroupScope`].
    pub struct PatchgroupId;
}

bitflags::bitflags! {
    /// Patchgroup flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PatchgroupFlags: u32 {
        /// Single-outstanding: only one atomic patchgroup may be live at once,
        /// and its patches are meant to land in one journal transaction.
        const ATOMIC = 1 << 0;
    }
}

/// Failure kinds specific to the patchgroup API.
#[derive(Debug, Error)]
pub enum PatchgroupError {
    /// The patchgroup has already been released; its `head` hub is gone.
    #[error("patchgroup has been released")]
    Released,
    /// `add_depend`'s `after` group already has afters of its own, or has
    /// itself been released.
    #[error("patchgroup cannot take a new before dependency")]
    CannotDepend,
    /// Attempted to create a second atomic patchgroup while one is live.
    #[error("an atomic patchgroup is already outstanding")]
    AtomicBusy,
    /// The requested patchgroup id is not known to this scope.
    #[error("no such patchgroup in this scope")]
    NoSuchPatchgroup,
    /// Underlying patch-graph engine error.
    #[error(transparent)]
    Engine(#[from] FeatherstitchError),
}

/// Convenience alias for patchgroup operations.
pub type Result<T> = std::result::Result<T, PatchgroupError>;

/// A named set of patches sharing external ordering constraints. Built
/// from four EMPTY hub patches; `head`/`tail` are the edges other
/// patchgroups attach to, `head_keep`/`tail_keep` are kept alive (via a
/// self-dependency) only to pin the hubs until they're no longer needed.
#[derive(Clone)]
pub struct Patchgroup {
    id: PatchgroupId,
    head_keep: PatchId,
    head: PatchId,
    tail_keep: PatchId,
    tail: PatchId,
    references: u32,
    engaged_count: u32,
    has_data: bool,
    is_released: bool,
    has_afters: bool,
    has_befores: bool,
    flags: PatchgroupFlags,
}

impl Patchgroup {
    /// This group's id.
    pub fn id(&self) -> PatchgroupId {
        self.id
    }

    /// Whether `release` has already been called.
    pub fn is_released(&self) -> bool {
        self.is_released
    }

    /// Whether this is an atomic (single-outstanding, journaled) group.
    pub fn is_atomic(&self) -> bool {
        self.flags.contains(PatchgroupFlags::ATOMIC)
    }
}

/// Process-local patchgroup state: a map from id to group, plus the
/// `top`/`bottom` hubs used to splice newly created patches into every
/// currently engaged group.
pub struct PatchgroupScope {
    engine: SharedEngine,
    groups: SlotMap<PatchgroupId, Patchgroup>,
    engaged: HashMap<PatchgroupId, ()>,
    top: Option<PatchId>,
    bottom: Option<PatchId>,
    atomic_outstanding: Option<PatchgroupId>,
}

impl PatchgroupScope {
    /// Creates an empty scope over a shared engine.
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            groups: SlotMap::with_key(),
            engaged: HashMap::new(),
            top: None,
            bottom: None,
            atomic_outstanding: None,
        }
    }

    /// Creates a new patchgroup.
    pub fn create(&mut self, flags: PatchgroupFlags) -> Result<PatchgroupId> {
        if flags.contains(PatchgroupFlags::ATOMIC) && self.atomic_outstanding.is_some() {
            return Err(PatchgroupError::AtomicBusy);
        }

        let mut engine = self.engine.lock();
        let head_keep = engine.create_empty(None, &[])?;
        let head = engine.create_empty(None, &[])?;
        let tail_keep = engine.create_empty(None, &[])?;
        let tail = engine.create_empty(None, &[])?;
        engine.add_depend(head_keep, head)?;
        engine.add_depend(tail, tail_keep)?;
        drop(engine);

        let id = self.groups.insert_with_key(|id| Patchgroup {
            id,
            head_keep,
            head,
            tail_keep,
            tail,
            references: 1,
            engaged_count: 0,
            has_data: false,
            is_released: false,
            has_afters: false,
            has_befores: false,
            flags,
        });

        if flags.contains(PatchgroupFlags::ATOMIC) {
            self.atomic_outstanding = Some(id);
        }
        debug!(?id, "patchgroup created");
        Ok(id)
    }

    fn group(&self, id: PatchgroupId) -> Result<&Patchgroup> {
        self.groups.get(id).ok_or(PatchgroupError::NoSuchPatchgroup)
    }

    fn group_mut(&mut self, id: PatchgroupId) -> Result<&mut Patchgroup> {
        self.groups.get_mut(id).ok_or(PatchgroupError::NoSuchPatchgroup)
    }

    /// Attaches `before.head -> after.tail` so everything in `after`
    /// becomes durable after everything in `before`.
    pub fn add_depend(&mut self, after: PatchgroupId, before: PatchgroupId) -> Result<()> {
        {
            let after_group = self.group(after)?;
            if after_group.is_released || after_group.has_afters {
                return Err(PatchgroupError::CannotDepend);
            }
        }
        let before_group = self.group(before)?;
        if before_group.is_released {
            return Err(PatchgroupError::Released);
        }
        let (before_head, after_tail) = (before_group.head, self.group(after)?.tail);

        self.engine.lock().add_depend(after_tail, before_head)?;

        self.group_mut(before)?.has_afters = true;
        self.group_mut(after)?.has_befores = true;
        Ok(())
    }

    /// Engages a patchgroup: every patch created through
    /// [`crate::engine::Engine`] while any group is engaged gains
    /// `scope.bottom` as an extra before, and `scope.top` depends on it,
    /// so the group "captures" everything issued in between.
    pub fn engage(&mut self, id: PatchgroupId) -> Result<()> {
        let group = self.group_mut(id)?;
        group.engaged_count += 1;
        if group.engaged_count == 1 && self.engaged.is_empty() {
            let mut engine = self.engine.lock();
            let bottom = engine.create_empty(None, &[])?;
            let top = engine.create_empty(None, &[bottom])?;
            drop(engine);
            self.bottom = Some(bottom);
            self.top = Some(top);
        }
        self.engaged.insert(id, ());
        debug!(?id, "patchgroup engaged");
        Ok(())
    }

    /// Disengages a patchgroup previously engaged with [`Self::engage`].
    pub fn disengage(&mut self, id: PatchgroupId) -> Result<()> {
        let group = self.group_mut(id)?;
        if group.engaged_count == 0 {
            return Err(PatchgroupError::CannotDepend);
        }
        group.engaged_count -= 1;
        self.engaged.remove(&id);
        if self.engaged.is_empty() {
            self.top = None;
            self.bottom = None;
        }
        debug!(?id, "patchgroup disengaged");
        Ok(())
    }

    /// The before-patch newly created patches should gain while engaged,
    /// if any group is currently engaged.
    pub fn capture_before(&self) -> Option<PatchId> {
        self.bottom
    }

    /// Marks a patchgroup released: its `tail_keep` is satisfied, freeing
    /// the group to become abandonable once all its patches land.
    pub fn release(&mut self, id: PatchgroupId) -> Result<()> {
        let group = self.group_mut(id)?;
        if group.is_released {
            return Err(PatchgroupError::Released);
        }
        group.is_released = true;
        if group.flags.contains(PatchgroupFlags::ATOMIC) && self.atomic_outstanding == Some(id) {
            self.atomic_outstanding = None;
        }
        debug!(?id, "patchgroup released");
        Ok(())
    }

    /// Drops this scope's reference to a released group with no
    /// outstanding patches.
    pub fn abandon(&mut self, id: PatchgroupId) -> Result<()> {
        let group = self.group(id)?;
        if !group.is_released {
            return Err(PatchgroupError::CannotDepend);
        }
        self.groups.remove(id);
        debug!(?id, "patchgroup abandoned");
        Ok(())
    }

    /// Attaches a human-readable label to a group, for debug tracing.
    pub fn label(&mut self, id: PatchgroupId, text: &str) -> Result<()> {
        let _ = self.group(id)?;
        debug!(?id, label = text, "patchgroup labeled");
        Ok(())
    }

    /// Forks this scope: every engaged count is preserved in the copy.
    pub fn fork(&self, engine: SharedEngine) -> Self {
        Self {
            engine,
            groups: self.groups.clone(),
            engaged: self.engaged.clone(),
            top: self.top,
            bottom: self.bottom,
            atomic_outstanding: self.atomic_outstanding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn second_atomic_group_is_rejected_while_one_is_outstanding() {
        let engine = Engine::shared(true);
        let mut scope = PatchgroupScope::new(engine);
        let first = scope.create(PatchgroupFlags::ATOMIC).unwrap();
        assert!(matches!(scope.create(PatchgroupFlags::ATOMIC), Err(PatchgroupError::AtomicBusy)));
        scope.release(first).unwrap();
        assert!(scope.create(PatchgroupFlags::ATOMIC).is_ok());
    }

    #[test]
    fn add_depend_links_head_to_tail() {
        let engine = Engine::shared(true);
        let mut scope = PatchgroupScope::new(engine.clone());
        let g1 = scope.create(PatchgroupFlags::empty()).unwrap();
        let g2 = scope.create(PatchgroupFlags::empty()).unwrap();
        scope.add_depend(g2, g1).unwrap();

        let g1_head = scope.group(g1).unwrap().head;
        let g2_tail = scope.group(g2).unwrap().tail;
        let e = engine.lock();
        assert!(e.patch(g2_tail).befores.contains(&g1_head));
    }
}
