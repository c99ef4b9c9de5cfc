//! Revision tails and revision slices.
//!
//! A revision tail is the fixpoint loop that rolls a block's foreign
//! patches out of the way before a write and back afterward
//! ([`Engine::apply`]/[`Engine::rollback`] do the actual per-patch work).
//! A revision slice moves a block's ready patches one level down between
//! two block devices.
//!
//! [`LandingQueue`] schedules in-flight blocks through a lock-free queue
//! plus a condvar for blocking waiters, so an I/O completion handler and a
//! control thread can hand off landed writes without a kernel spinlock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex as PlMutex};
use tracing::debug;

use crate::bdesc::BdescId;
use crate::engine::Engine;
use crate::error::{FeatherstitchError, Result};
use crate::patch::{PatchFlags, PatchId};
use crate::types::BdHandle;

impl Engine {
    /// Rolls back every patch on `block` **not** owned by `owner`: a block
    /// device must see its own writes applied but every patch layered on
    /// top of them rolled out of the way before handing the buffer to the
    /// layer below.
    ///
    /// Patches are rolled back oldest-admissible-first: a patch can only
    /// be rolled back once every same-block, non-rolled-back after that
    /// overlaps it has itself been rolled back. The loop is a fixpoint.
    pub fn revision_tail_prepare(&mut self, block: BdescId, owner: BdHandle) -> Result<usize> {
        self.tail_roll(block, owner, Roll::Back)
    }

    /// Re-applies (rolls forward) every patch on `block` not owned by
    /// `owner`, undoing a prior `revision_tail_prepare`.
    pub fn revision_tail_revert(&mut self, block: BdescId, owner: BdHandle) -> Result<usize> {
        self.tail_roll(block, owner, Roll::Forward)
    }

    /// Satisfies every befores-free patch owned by `owner` on `block`,
    /// then re-applies the foreign patches rolled back to make room for
    /// the write. Call after the write to `block` completes.
    pub fn revision_tail_acknowledge(&mut self, block: BdescId, owner: BdHandle) -> Result<usize> {
        let satisfied = self.tail_satisfy(block, Select::Owner(owner))?;
        self.revision_tail_revert(block, owner)?;
        Ok(satisfied)
    }

    /// Marks every patch owned by `owner` on `block` as in flight
    /// (in-flight patches sit one level above their owner's), retains the
    /// block so it cannot be freed mid-flight, and rolls the foreign
    /// patches back forward so readers still see a consistent buffer.
    pub fn revision_tail_inflight_ack(&mut self, block: BdescId, owner: BdHandle) -> Result<()> {
        let owned: Vec<PatchId> = self.bdesc(block).owned_by(owner.graph_index).collect();
        for id in owned {
            let old_level = self.patch(id).level();
            self.patch_mut(id).flags.insert(PatchFlags::INFLIGHT);
            let new_level = self.patch(id).level();
            self.update_ready(id);
            if old_level != new_level {
                self.propagate_level_change(id, old_level, new_level);
            }
        }
        for id in self.bdesc(block).newest_first().collect::<Vec<_>>() {
            if self.patch(id).owner.map(|o| o.id) != Some(owner.id) && !self.patch(id).is_rollbackable() {
                debug!(?id, "non-rollbackable patch found with foreign ownership during inflight_ack");
            }
        }
        self.bdesc_mut(block).in_flight = true;
        self.retain_bdesc(block);
        self.revision_tail_revert(block, owner)?;
        Ok(())
    }

    /// Satisfies every in-flight, befores-free patch on `block` and
    /// clears its in-flight state. The landing acknowledgement.
    fn revision_tail_ack_landed(&mut self, block: BdescId) -> Result<usize> {
        let satisfied = self.tail_satisfy(block, Select::Flight)?;
        self.bdesc_mut(block).in_flight = false;
        self.release_bdesc(block);
        Ok(satisfied)
    }

    fn tail_roll(&mut self, block: BdescId, owner: BdHandle, direction: Roll) -> Result<usize> {
        let owned: HashSet<PatchId> = self.bdesc(block).owned_by(owner.graph_index).collect();
        let candidates: Vec<PatchId> = self
            .bdesc(block)
            .newest_first()
            .filter(|id| !owned.contains(id))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let order: Vec<PatchId> = match direction {
            Roll::Back => candidates,
            Roll::Forward => candidates.into_iter().rev().collect(),
        };

        let mut remaining: HashSet<PatchId> = order.iter().copied().collect();
        loop {
            let mut again = false;
            let mut progress = false;
            for &id in &order {
                if !remaining.contains(&id) {
                    continue;
                }
                let blocked = match direction {
                    Roll::Back => self.patch(id).afters.iter().any(|&after| {
                        self.contains_patch(after)
                            && !self.patch(after).flags.contains(PatchFlags::ROLLBACK)
                            && self.patch(after).block == Some(block)
                            && matches!(self.overlap_check(after, id), crate::patch::Overlap::Partial | crate::patch::Overlap::Complete)
                    }),
                    Roll::Forward => self.patch(id).befores.iter().any(|&before| {
                        self.contains_patch(before)
                            && self.patch(before).flags.contains(PatchFlags::ROLLBACK)
                            && self.patch(before).block == Some(block)
                            && matches!(self.overlap_check(before, id), crate::patch::Overlap::Partial | crate::patch::Overlap::Complete)
                    }),
                };

                let already_done = match direction {
                    Roll::Back => self.patch(id).flags.contains(PatchFlags::ROLLBACK),
                    Roll::Forward => !self.patch(id).flags.contains(PatchFlags::ROLLBACK),
                };
                if already_done {
                    remaining.remove(&id);
                    continue;
                }

                if blocked {
                    again = true;
                } else {
                    match direction {
                        Roll::Back => self.rollback(id)?,
                        Roll::Forward => self.apply(id)?,
                    }
                    remaining.remove(&id);
                    progress = true;
                }
            }
            if !again {
                break;
            }
            if !progress {
                return Err(FeatherstitchError::InvalidArgument(
                    "revision tail loop made no progress (cyclic overlap?)".into(),
                ));
            }
        }
        Ok(order.len())
    }

    fn tail_satisfy(&mut self, block: BdescId, select: Select) -> Result<usize> {
        let mut candidates: Vec<PatchId> = match select {
            Select::Owner(owner) => self.bdesc(block).owned_by(owner.graph_index).collect(),
            Select::Flight => self
                .bdesc(block)
                .newest_first()
                .filter(|&id| self.patch(id).flags.contains(PatchFlags::INFLIGHT))
                .collect(),
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut satisfied = 0;
        loop {
            let mut still_blocked = false;
            let mut progress = false;
            let round = candidates.clone();
            for id in round {
                if !self.contains_patch(id) {
                    continue;
                }
                if self.patch(id).befores.is_empty() {
                    self.satisfy(id)?;
                    satisfied += 1;
                    progress = true;
                } else {
                    still_blocked = true;
                }
            }
            candidates.retain(|&id| self.contains_patch(id));
            if !still_blocked || candidates.is_empty() {
                break;
            }
            if !progress {
                return Err(FeatherstitchError::InvalidArgument(
                    "revision tail acknowledge made no progress (remaining befores never satisfied)".into(),
                ));
            }
        }
        Ok(satisfied)
    }
}

#[derive(Clone, Copy)]
enum Roll {
    Back,
    Forward,
}

#[derive(Clone, Copy)]
enum Select {
    Owner(BdHandle),
    Flight,
}

/// A freshly identified flight, returned by [`LandingQueue::schedule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlightId(u64);

/// Async bookkeeping for blocks in flight to the layer below.
///
/// A block device schedules a flight before issuing the write, requests
/// landing when the write completes, and a (possibly different) thread
/// drains landed flights by calling back into the engine.
pub struct LandingQueue {
    next_id: AtomicU64,
    scheduled: SegQueue<FlightId>,
    landed: SegQueue<(FlightId, BdescId)>,
    wake: (PlMutex<()>, Condvar),
}

impl LandingQueue {
    /// Creates an empty landing queue.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            scheduled: SegQueue::new(),
            landed: SegQueue::new(),
            wake: (PlMutex::new(()), Condvar::new()),
        }
    }

    /// Registers an upcoming flight before its write is issued.
    pub fn schedule(&self) -> FlightId {
        let id = FlightId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.scheduled.push(id);
        id
    }

    /// Cancels a scheduled flight that never went out (e.g. the write call
    /// failed synchronously before any I/O was issued).
    pub fn cancel(&self, _flight: FlightId) {
        self.scheduled.pop();
    }

    /// Whether any flight is scheduled or awaiting processing.
    pub fn flights_exist(&self) -> bool {
        !self.scheduled.is_empty() || !self.landed.is_empty()
    }

    /// Moves a flight from "scheduled" to "landed" once its write
    /// completes, and wakes anyone blocked in
    /// [`LandingQueue::wait_for_landing`].
    pub fn request_landing(&self, flight: FlightId, block: BdescId) {
        self.scheduled.pop();
        self.landed.push((flight, block));
        let _guard = self.wake.0.lock();
        self.wake.1.notify_all();
    }

    /// Drains every landed flight, acknowledging each block's in-flight
    /// patches via `engine`.
    pub fn process_landing_requests(&self, engine: &mut Engine) -> Result<usize> {
        let mut total = 0;
        while let Some((_flight, block)) = self.landed.pop() {
            total += engine.revision_tail_ack_landed(block)?;
        }
        Ok(total)
    }

    /// Blocks the calling thread until at least one flight has landed.
    pub fn wait_for_landing(&self) {
        let mut guard = self.wake.0.lock();
        while self.landed.is_empty() {
            self.wake.1.wait(&mut guard);
        }
    }
}

impl Default for LandingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of ready patches moved one level down between two block devices.
/// Block devices don't need to know whether patches they don't own sit
/// above or below them in the stack; a slice is how the write path finds
/// out which ones are ready to go out.
pub struct RevisionSlice {
    owner: BdHandle,
    target: BdHandle,
    all_ready: bool,
    ready: Vec<PatchId>,
}

impl RevisionSlice {
    /// Whether every patch on the slice's block is ready (no patches
    /// remain owned by `owner` outside this slice).
    pub fn all_ready(&self) -> bool {
        self.all_ready
    }

    /// The patches moved down by this slice.
    pub fn ready(&self) -> &[PatchId] {
        &self.ready
    }
}

impl Engine {
    /// Builds a revision slice: moves every patch ready at `owner`'s level
    /// on `block` down to `target`. `target` must be exactly one level
    /// below `owner`.
    ///
    /// If `block` carries a non-ready patch owned by `owner` that can't be
    /// rolled back, the block can't be split: moving the ready patches
    /// down while that one stays behind would leave an on-disk image that
    /// can never be reconstructed by rolling the held-back patch out of
    /// the way. In that case nothing is moved and an empty, not-all-ready
    /// slice is returned instead.
    pub fn revision_slice_create(&mut self, block: BdescId, owner: BdHandle, target: BdHandle) -> Result<RevisionSlice> {
        if owner.level == 0 || owner.level - 1 != target.level {
            return Err(FeatherstitchError::InvalidArgument(
                "revision slice target must be exactly one level below owner".into(),
            ));
        }

        let cant_split = self
            .bdesc(block)
            .owned_by(owner.graph_index)
            .any(|id| !self.patch(id).is_ready() && !self.patch(id).is_rollbackable());
        if cant_split {
            return Ok(RevisionSlice {
                owner,
                target,
                all_ready: false,
                ready: Vec::new(),
            });
        }

        let ready: Vec<PatchId> = self.bdesc(block).ready_at(owner.level).collect();
        for &id in &ready {
            self.reassign_owner(block, id, owner, target)?;
        }

        let all_ready = self.bdesc(block).owned_by(owner.graph_index).next().is_none();

        Ok(RevisionSlice {
            owner,
            target,
            all_ready,
            ready,
        })
    }

    /// Confirms a slice's patches belong to `target` (idempotent: they
    /// were already moved by `revision_slice_create`; this exists to
    /// mirror the commit side of a create/push/pull trio whose pull side
    /// is the failure path).
    pub fn revision_slice_push_down(&mut self, block: BdescId, slice: &RevisionSlice) -> Result<()> {
        for &id in &slice.ready {
            if self.patch(id).owner.map(|o| o.id) == Some(slice.owner.id) {
                self.reassign_owner(block, id, slice.owner, slice.target)?;
            }
        }
        Ok(())
    }

    /// Undoes a revision slice: moves its patches back up to `owner`,
    /// used when the write the slice was prepared for fails.
    pub fn revision_slice_pull_up(&mut self, block: BdescId, slice: &RevisionSlice) -> Result<()> {
        for &id in &slice.ready {
            if self.patch(id).owner.map(|o| o.id) == Some(slice.target.id) {
                self.reassign_owner(block, id, slice.target, slice.owner)?;
            }
        }
        Ok(())
    }

    fn reassign_owner(&mut self, block: BdescId, id: PatchId, from: BdHandle, to: BdHandle) -> Result<()> {
        let prev_level = self.patch(id).level();
        self.bdesc_mut(block).unlink_ready(from.level, id);
        self.bdesc_mut(block).unlink_index(from.graph_index, id);
        self.patch_mut(id).owner = Some(to);
        let new_level = self.patch(id).level();
        self.bdesc_mut(block).link_index(to.graph_index, id);
        if prev_level != new_level {
            self.propagate_level_change(id, prev_level, new_level);
        }
        self.update_ready(id);
        Ok(())
    }
}
