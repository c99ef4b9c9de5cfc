//! Engine-wide configuration.
//!
//! One struct, sane defaults, every knob documented inline rather than
//! buried in a `#define`.

/// Tunables for an [`crate::engine::Engine`] and the write-back cache(s)
/// built on top of it.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Block size in bytes used by newly allocated bdescs.
    pub block_size: usize,
    /// Total block budget for a write-back cache's "all" list.
    pub soft_blocks: usize,
    /// Dirty block budget for a write-back cache's "dirty" list.
    pub soft_dblocks: usize,
    /// Low hysteresis ratio against `soft_dblocks`: the dirty list is
    /// allowed to drain down to this fraction before the cache stops
    /// flushing under `Clip`.
    pub dirty_low_ratio: f64,
    /// High hysteresis ratio against `soft_dblocks`: the cache starts
    /// flushing once the dirty list crosses this fraction.
    pub dirty_high_ratio: f64,
    /// Whether `add_depend` walks the before-DAG to reject cycles; off
    /// trades safety for speed once a caller is trusted.
    pub cycle_checking: bool,
    /// Default flush strategy used by `flush(FlushRequest::Device)`.
    pub default_strategy: FlushStrategy,
}

/// Flush strategies for a write-back cache's periodic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Stop once the dirty list has drained below the low hysteresis mark.
    Clip,
    /// Keep going until the dirty list is empty.
    Flush,
    /// Stop at the first write that appears to have stalled.
    Preen,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            soft_blocks: 1024,
            soft_dblocks: 256,
            dirty_low_ratio: 0.9,
            dirty_high_ratio: 1.1,
            cycle_checking: true,
            default_strategy: FlushStrategy::Clip,
        }
    }
}

impl EngineOptions {
    /// Low dirty-count hysteresis mark, rounded down.
    pub fn dirty_low_mark(&self) -> usize {
        (self.soft_dblocks as f64 * self.dirty_low_ratio) as usize
    }

    /// High dirty-count hysteresis mark, rounded up.
    pub fn dirty_high_mark(&self) -> usize {
        (self.soft_dblocks as f64 * self.dirty_high_ratio).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_marks_bracket_the_setpoint() {
        let opts = EngineOptions::default();
        assert!(opts.dirty_low_mark() < opts.soft_dblocks);
        assert!(opts.dirty_high_mark() > opts.soft_dblocks);
    }
}
