//! The `BlockDevice` trait and a raw-disk bottom-of-stack implementation.
//!
//! `RawDiskBd`'s I/O handling is plain `File`/`OpenOptions` with explicit
//! flush points after every write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::bdesc::BdescId;
use crate::engine::SharedEngine;
use crate::error::{FeatherstitchError, Result};
use crate::patch::PatchId;
use crate::types::{BdHandle, BdId, BlockNumber, GraphIndex, Level};

/// Outcome of a `flush(FLUSH_DEVICE)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// Every dirty block was written and the device has nothing left to flush.
    Done,
    /// Progress was made but dirty blocks remain.
    Some,
    /// No progress was possible (e.g. nothing ready, or all in flight).
    None,
    /// There was nothing to flush in the first place.
    Empty,
}

/// What to flush: a single block, or the whole device.
#[derive(Debug, Clone, Copy)]
pub enum FlushRequest {
    /// Flush only this block.
    Block(BlockNumber),
    /// Flush the entire device (loop until `Done` or stalled).
    Device,
}

/// A node in the block device stack.
///
/// Kept object-safe so a `Box<dyn BlockDevice>` stack can be assembled at
/// runtime (a cache above a raw disk is just another BD).
pub trait BlockDevice {
    /// This device's identity, level, and index snapshot.
    fn handle(&self) -> BdHandle;

    /// The shared patch-graph engine this device's blocks are allocated in.
    fn engine(&self) -> &SharedEngine;

    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Total number of addressable blocks, if known.
    fn num_blocks(&self) -> Option<BlockNumber>;

    /// Reads a block, populating it from the layer below (or this device's
    /// own storage) if not already cached.
    fn read_block(&mut self, number: BlockNumber) -> Result<BdescId>;

    /// Allocates a block descriptor without reading it from storage.
    fn synthetic_read_block(&mut self, number: BlockNumber) -> Result<BdescId>;

    /// Accepts a block for writing; patches owned by this device are
    /// eventually made durable.
    fn write_block(&mut self, block: BdescId, number: BlockNumber) -> Result<()>;

    /// Flushes dirty state per `request`.
    fn flush(&mut self, request: FlushRequest) -> Result<FlushResult>;

    /// An optional patch used as a write-ordering barrier for freshly
    /// created patches (most devices return `None`).
    fn get_write_head(&self) -> Option<PatchId> {
        None
    }

    /// Signed slack against this device's soft limit; negative means over
    /// budget. A back-pressure signal for callers deciding whether to flush.
    fn get_block_space(&self) -> i64 {
        i64::MAX
    }
}

/// The bottom of the stack: a flat file (or in-memory buffer) addressed
/// directly by block number, always at level 0.
pub struct RawDiskBd {
    handle: BdHandle,
    engine: SharedEngine,
    block_size: usize,
    num_blocks: Option<BlockNumber>,
    backing: Backing,
}

enum Backing {
    File(File),
    Memory(Vec<u8>),
}

impl RawDiskBd {
    /// Opens a file-backed raw disk. `num_blocks` is derived from the
    /// file's length.
    pub fn open(path: impl AsRef<Path>, block_size: usize, engine: SharedEngine) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let num_blocks = Some(len / block_size as u64);
        debug!(path = %path.as_ref().display(), block_size, num_blocks = ?num_blocks, "opened raw disk");
        Ok(Self {
            handle: BdHandle { id: BdId::fresh(), level: 0, graph_index: 0 },
            engine,
            block_size,
            num_blocks,
            backing: Backing::File(file),
        })
    }

    /// Creates an in-memory raw disk of `num_blocks` blocks, useful for
    /// tests.
    pub fn in_memory(block_size: usize, num_blocks: BlockNumber, engine: SharedEngine) -> Self {
        Self {
            handle: BdHandle { id: BdId::fresh(), level: 0, graph_index: 0 },
            engine,
            block_size,
            num_blocks: Some(num_blocks),
            backing: Backing::Memory(vec![0u8; block_size * num_blocks as usize]),
        }
    }

    fn read_raw(&mut self, number: BlockNumber) -> Result<Box<[u8]>> {
        let size = self.block_size;
        match &mut self.backing {
            Backing::Memory(buf) => {
                let start = number as usize * size;
                let end = start + size;
                if end > buf.len() {
                    return Err(FeatherstitchError::InvalidArgument("block number out of range".into()));
                }
                Ok(buf[start..end].to_vec().into_boxed_slice())
            }
            Backing::File(file) => {
                let mut data = vec![0u8; size];
                file.seek(SeekFrom::Start(number * size as u64))?;
                file.read_exact(&mut data)?;
                Ok(data.into_boxed_slice())
            }
        }
    }

    fn write_raw(&mut self, number: BlockNumber, data: &[u8]) -> Result<()> {
        match &mut self.backing {
            Backing::Memory(buf) => {
                let start = number as usize * data.len();
                let end = start + data.len();
                if end > buf.len() {
                    return Err(FeatherstitchError::InvalidArgument("block number out of range".into()));
                }
                buf[start..end].copy_from_slice(data);
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(number * data.len() as u64))?;
                file.write_all(data)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl BlockDevice for RawDiskBd {
    fn handle(&self) -> BdHandle {
        self.handle
    }

    fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> Option<BlockNumber> {
        self.num_blocks
    }

    fn read_block(&mut self, number: BlockNumber) -> Result<BdescId> {
        let data = self.read_raw(number)?;
        let mut engine = self.engine.lock();
        Ok(engine.alloc_from_disk(number, data))
    }

    fn synthetic_read_block(&mut self, number: BlockNumber) -> Result<BdescId> {
        let mut engine = self.engine.lock();
        Ok(engine.alloc_synthetic(number, self.block_size))
    }

    fn write_block(&mut self, block: BdescId, number: BlockNumber) -> Result<()> {
        let owner = self.handle;
        {
            let mut engine = self.engine.lock();
            engine.revision_tail_prepare(block, owner)?;
        }

        let snapshot = self.engine.lock().bdesc(block).data.to_vec();
        let write_result = self.write_raw(number, &snapshot);

        let mut engine = self.engine.lock();
        match write_result {
            Ok(()) => {
                engine.revision_tail_revert(block, owner)?;
                engine.revision_tail_acknowledge(block, owner)?;
                engine.reclaim_written();
                Ok(())
            }
            Err(e) => {
                warn!(number, error = %e, "raw disk write failed");
                engine.revision_tail_revert(block, owner)?;
                Err(e)
            }
        }
    }

    fn flush(&mut self, _request: FlushRequest) -> Result<FlushResult> {
        // A raw disk has no caching of its own: every write is already durable.
        Ok(FlushResult::Empty)
    }

    fn get_block_space(&self) -> i64 {
        i64::MAX
    }
}

/// Assigns the next `graph_index` in a stack, the way each constructed BD
/// needs a distinct one to bound its per-block index arrays.
pub fn next_graph_index(level: Level, stack_position: GraphIndex) -> BdHandle {
    BdHandle {
        id: BdId::fresh(),
        level,
        graph_index: stack_position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn raw_disk_roundtrips_a_write() {
        let engine = Engine::shared(true);
        let mut disk = RawDiskBd::in_memory(512, 4, engine.clone());

        let block = disk.synthetic_read_block(1).unwrap();
        let owner = disk.handle();
        {
            let mut e = engine.lock();
            e.create_byte(block, owner, 0, 4, Some(&[1, 2, 3, 4]), &[]).unwrap();
        }

        disk.write_block(block, 1).unwrap();

        let reread = disk.read_block(1).unwrap();
        let e = engine.lock();
        assert_eq!(&e.bdesc(reread).data[0..4], &[1, 2, 3, 4]);
    }
}
