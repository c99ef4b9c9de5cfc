//! Crate-wide error type.
//!
//! One `thiserror` enum, one `Result` alias, a variant per failure kind
//! the engine and block device stack can report.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FeatherstitchError>;

/// Failure kinds the engine can report.
#[derive(Debug, Error)]
pub enum FeatherstitchError {
    /// Allocation failed (arena exhausted, or an underlying allocation failed).
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// A caller-supplied argument was malformed (bad offset/length/state).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested operation can't proceed because a resource is held
    /// (e.g. destroying a block device with dirty blocks still attached).
    #[error("resource busy: {0}")]
    Busy(String),

    /// Adding the requested dependency edge would create a cycle in the
    /// patch graph (only reported when cycle checking is enabled).
    #[error("dependency would create a cycle")]
    CycleDetected,

    /// The layer below rejected a write; the caller's block remains dirty.
    #[error("write failed: {0}")]
    WriteFailure(String),

    /// A patchgroup id (or other handle) is not known to the current scope.
    #[error("no such resource")]
    NoSuchResource,

    /// The engine is shutting down and can no longer accept new work.
    #[error("engine is shutting down")]
    Shutdown,

    /// Underlying I/O failure from a raw block device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeatherstitchError {
    /// Maps this error to the conventional numeric code a syscall-facing
    /// surface would report to applications.
    pub fn to_errno(&self) -> i32 {
        match self {
            FeatherstitchError::OutOfMemory(_) => libc_errno::ENOMEM,
            FeatherstitchError::InvalidArgument(_) => libc_errno::EINVAL,
            FeatherstitchError::Busy(_) => libc_errno::EBUSY,
            FeatherstitchError::CycleDetected => libc_errno::ELOOP,
            FeatherstitchError::WriteFailure(_) => libc_errno::EIO,
            FeatherstitchError::NoSuchResource => libc_errno::ENOENT,
            FeatherstitchError::Shutdown => libc_errno::ESHUTDOWN,
            FeatherstitchError::Io(_) => libc_errno::EIO,
        }
    }
}

/// Conventional numeric error codes, kept local so this crate doesn't pull
/// in a libc dependency just to name a handful of constants.
mod libc_errno {
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const EBUSY: i32 = 16;
    pub const ELOOP: i32 = 40;
    pub const EIO: i32 = 5;
    pub const ENOENT: i32 = 2;
    pub const ESHUTDOWN: i32 = 108;
}
