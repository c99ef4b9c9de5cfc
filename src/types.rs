//! Small shared type aliases and constants used across the engine.

/// A disk block number, as addressed by the bottom-most raw device.
pub type BlockNumber = u64;

/// Distance of a block device from stable storage.
/// Stable disk is level 0; each cache that delays writes adds one.
pub type Level = u32;

/// Sentinel meaning "no level" (used for patches with no befores at all).
pub const LEVEL_NONE: Level = Level::MAX;

/// Per-BD index into a block's `index_patches` array, used to look up the
/// patches that BD owns on a given block without scanning every patch on it.
pub type GraphIndex = u32;

/// Identity of a block device within the stack. Patches only need a BD's
/// level and graph index (for dependency bookkeeping) plus a stable
/// identity for equality checks (not the BD itself), so patches never
/// borrow a `dyn BlockDevice`. This keeps the patch/engine modules
/// decoupled from the `bd` module's trait object machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BdId(pub(crate) u64);

static NEXT_BD_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl BdId {
    /// Allocates a fresh, process-unique BD identity.
    pub fn fresh() -> Self {
        Self(NEXT_BD_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// Snapshot of a block device's identity and position in the stack, as
/// recorded on every patch it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BdHandle {
    /// Stable identity, distinct per constructed BD.
    pub id: BdId,
    /// Distance from stable storage.
    pub level: Level,
    /// Index into this BD's per-block index arrays.
    pub graph_index: GraphIndex,
}
