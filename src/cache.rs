//! Write-back cache block device.
//!
//! Two LRUs over the same block handles: an "all" LRU of every cached
//! block and a "dirty" LRU of the subset still owned by this cache. Two
//! linked lists over one node set, rather than one cache with a dirty bit
//! per entry, so eviction and flush scans never have to filter the other
//! concern out.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::bd::{BlockDevice, FlushRequest, FlushResult};
use crate::bdesc::BdescId;
use crate::config::{EngineOptions, FlushStrategy};
use crate::engine::SharedEngine;
use crate::error::Result;
use crate::patch::PatchId;
use crate::types::{BdHandle, BdId, BlockNumber};

/// An LRU write-back cache sitting above another [`BlockDevice`].
pub struct WriteBackCacheBd {
    handle: BdHandle,
    engine: SharedEngine,
    lower: Box<dyn BlockDevice>,
    options: EngineOptions,
    all: LruCache<BlockNumber, BdescId>,
    dirty: LruCache<BlockNumber, ()>,
}

impl WriteBackCacheBd {
    /// Wraps `lower` with a write-back cache at one level above it.
    pub fn new(lower: Box<dyn BlockDevice>, engine: SharedEngine, options: EngineOptions) -> Self {
        let lower_level = lower.handle().level;
        let all_cap = NonZeroUsize::new(options.soft_blocks.max(1)).expect("soft_blocks > 0");
        let dirty_cap = NonZeroUsize::new(options.soft_dblocks.max(1)).expect("soft_dblocks > 0");
        Self {
            handle: BdHandle {
                id: BdId::fresh(),
                level: lower_level + 1,
                graph_index: lower.handle().graph_index + 1,
            },
            engine,
            lower,
            options,
            all: LruCache::new(all_cap),
            dirty: LruCache::new(dirty_cap),
        }
    }

    /// Dirty block count, kept exactly in sync with the dirty LRU's size.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    fn mark_dirty(&mut self, number: BlockNumber) {
        if self.dirty.put(number, ()).is_none() {
            debug!(number, dirty = self.dirty.len(), "cache block marked dirty");
        }
    }

    /// Evicts clean ("all" but not dirty) blocks from the LRU tail until
    /// `all.len()` is back under the soft limit, skipping any block still
    /// on the dirty list.
    fn evict_clean(&mut self) {
        while self.all.len() > self.options.soft_blocks {
            let Some((&number, _)) = self.all.iter().rev().find(|(n, _)| !self.dirty.contains(n)) else {
                break;
            };
            if let Some(bdesc) = self.all.pop(&number) {
                self.engine.lock().release_bdesc(bdesc);
            } else {
                break;
            }
        }
    }

    /// One flush attempt against a single dirty block number.
    fn flush_one(&mut self, number: BlockNumber) -> Result<bool> {
        let Some(&bdesc) = self.all.peek(&number) else {
            self.dirty.pop(&number);
            return Ok(false);
        };

        {
            let engine = self.engine.lock();
            if engine.bdesc(bdesc).in_flight {
                return Ok(false);
            }
        }

        let lower_handle = self.lower.handle();
        let slice = {
            let mut engine = self.engine.lock();
            engine.revision_slice_create(bdesc, self.handle, lower_handle)?
        };
        if slice.ready().is_empty() {
            return Ok(false);
        }

        match self.lower.write_block(bdesc, number) {
            Ok(()) => {
                let mut engine = self.engine.lock();
                engine.revision_slice_push_down(bdesc, &slice)?;
                if slice.all_ready() {
                    self.dirty.pop(&number);
                }
                Ok(true)
            }
            Err(e) => {
                let mut engine = self.engine.lock();
                engine.revision_slice_pull_up(bdesc, &slice)?;
                Err(e)
            }
        }
    }

    /// Opportunistic forward scan: after flushing `number`, flush
    /// block `number + 1`, `number + 2`, ... while each is still dirty.
    /// Stops at the first non-dirty slot rather than jumping a gap.
    fn coalesce_forward(&mut self, start: BlockNumber) -> Result<usize> {
        let mut flushed = 0;
        let mut next = start + 1;
        while self.dirty.contains(&next) {
            if !self.flush_one(next)? {
                break;
            }
            flushed += 1;
            next += 1;
        }
        Ok(flushed)
    }

    /// Runs one sweep of the dirty list per `strategy`, walking a snapshot
    /// of the dirty list from its LRU end so flushes (and the forward
    /// coalescing they trigger) can't perturb the walk itself.
    pub fn flush_strategy(&mut self, strategy: FlushStrategy) -> Result<FlushResult> {
        if self.dirty.is_empty() {
            return Ok(FlushResult::Empty);
        }

        let candidates: Vec<BlockNumber> = self.dirty.iter().rev().map(|(&n, _)| n).collect();
        let mut total = 0;

        for number in candidates {
            if !self.dirty.contains(&number) {
                continue;
            }
            if strategy == FlushStrategy::Clip && self.dirty.len() <= self.options.dirty_low_mark() {
                break;
            }
            match self.flush_one(number) {
                Ok(true) => {
                    total += 1;
                    total += self.coalesce_forward(number)?;
                }
                Ok(false) => {
                    if strategy == FlushStrategy::Preen {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        Ok(if self.dirty.is_empty() {
            FlushResult::Done
        } else if total > 0 {
            FlushResult::Some
        } else {
            FlushResult::None
        })
    }
}

impl BlockDevice for WriteBackCacheBd {
    fn handle(&self) -> BdHandle {
        self.handle
    }

    fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    fn block_size(&self) -> usize {
        self.options.block_size
    }

    fn num_blocks(&self) -> Option<BlockNumber> {
        self.lower.num_blocks()
    }

    fn read_block(&mut self, number: BlockNumber) -> Result<BdescId> {
        if let Some(&bdesc) = self.all.get(&number) {
            return Ok(bdesc);
        }
        let bdesc = self.lower.read_block(number)?;
        self.all.put(number, bdesc);
        self.evict_clean();
        Ok(bdesc)
    }

    fn synthetic_read_block(&mut self, number: BlockNumber) -> Result<BdescId> {
        if let Some(&bdesc) = self.all.get(&number) {
            return Ok(bdesc);
        }
        let bdesc = self.lower.synthetic_read_block(number)?;
        self.all.put(number, bdesc);
        self.evict_clean();
        Ok(bdesc)
    }

    fn write_block(&mut self, block: BdescId, number: BlockNumber) -> Result<()> {
        self.all.put(number, block);
        self.mark_dirty(number);
        if self.dirty.len() > self.options.dirty_high_mark() {
            self.flush_strategy(FlushStrategy::Clip)?;
        }
        Ok(())
    }

    fn flush(&mut self, request: FlushRequest) -> Result<FlushResult> {
        match request {
            FlushRequest::Block(number) => {
                if self.flush_one(number)? {
                    Ok(FlushResult::Some)
                } else {
                    Ok(FlushResult::None)
                }
            }
            FlushRequest::Device => {
                let mut last = FlushResult::Empty;
                loop {
                    last = self.flush_strategy(FlushStrategy::Flush)?;
                    if !matches!(last, FlushResult::Some) {
                        break;
                    }
                }
                Ok(last)
            }
        }
    }

    fn get_write_head(&self) -> Option<PatchId> {
        None
    }

    fn get_block_space(&self) -> i64 {
        self.options.soft_dblocks as i64 - self.dirty.len() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::RawDiskBd;
    use crate::engine::Engine;

    fn test_cache(soft_dblocks: usize) -> WriteBackCacheBd {
        let engine = Engine::shared(true);
        let disk = RawDiskBd::in_memory(512, 64, engine.clone());
        let options = EngineOptions {
            block_size: 512,
            soft_blocks: 32,
            soft_dblocks,
            ..EngineOptions::default()
        };
        WriteBackCacheBd::new(Box::new(disk), engine, options)
    }

    #[test]
    fn writing_past_soft_dblocks_flushes_the_oldest_block() {
        let mut cache = test_cache(1);
        let owner = cache.handle();

        let b1 = cache.synthetic_read_block(10).unwrap();
        {
            let mut e = cache.engine.lock();
            e.create_byte(b1, owner, 0, 4, Some(&[1, 1, 1, 1]), &[]).unwrap();
        }
        cache.write_block(b1, 10).unwrap();
        assert_eq!(cache.dirty_count(), 1);

        let b2 = cache.synthetic_read_block(20).unwrap();
        {
            let mut e = cache.engine.lock();
            e.create_byte(b2, owner, 0, 4, Some(&[2, 2, 2, 2]), &[]).unwrap();
        }
        cache.write_block(b2, 20).unwrap();

        assert!(cache.dirty_count() <= 1, "writing block 20 should have forced block 10 out");
    }

    #[test]
    fn get_block_space_reflects_dirty_budget() {
        let cache = test_cache(4);
        assert_eq!(cache.get_block_space(), 4);
    }
}
