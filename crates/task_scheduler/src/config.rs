//! Construction parameters for [`crate::Scheduler`].
//!
//! There is no file format, environment variable, or other persisted
//! configuration source for this crate — this builder is the entire
//! configuration surface, by design (see the crate's external-interfaces
//! docs).

use crate::sync_block::DEFAULT_SYNC_BLOCK_POOL_CAPACITY;

/// Default number of RHI (render-hardware-interface) threads.
pub const DEFAULT_N_RHI_THREADS: usize = 2;

/// Builder for [`crate::Scheduler::new`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    n_rhi_threads: usize,
    worker_count_override: Option<usize>,
    sync_block_pool_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            n_rhi_threads: DEFAULT_N_RHI_THREADS,
            worker_count_override: None,
            sync_block_pool_capacity: DEFAULT_SYNC_BLOCK_POOL_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Starts from the documented defaults (2 RHI threads, worker count
    /// derived from `available_parallelism`, a 16384-handle sync-block
    /// pool).
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the number of RHI threads (default 2).
    pub fn n_rhi_threads(mut self, n: usize) -> Self {
        self.n_rhi_threads = n;
        self
    }

    /// Overrides the computed worker-thread count entirely, bypassing the
    /// `max(1, cores - 2 - n_rhi_threads)` formula.
    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count_override = Some(n);
        self
    }

    /// Overrides the sync-block pool's static capacity (default 16384).
    pub fn sync_block_pool_capacity(mut self, n: usize) -> Self {
        self.sync_block_pool_capacity = n;
        self
    }

    pub(crate) fn n_rhi(&self) -> usize {
        self.n_rhi_threads
    }

    pub(crate) fn worker_override(&self) -> Option<usize> {
        self.worker_count_override
    }

    pub(crate) fn pool_capacity(&self) -> usize {
        self.sync_block_pool_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.n_rhi(), 2);
        assert_eq!(config.worker_override(), None);
        assert_eq!(config.pool_capacity(), DEFAULT_SYNC_BLOCK_POOL_CAPACITY);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = SchedulerConfig::new()
            .n_rhi_threads(4)
            .worker_count(8)
            .sync_block_pool_capacity(256);
        assert_eq!(config.n_rhi(), 4);
        assert_eq!(config.worker_override(), Some(8));
        assert_eq!(config.pool_capacity(), 256);
    }
}
