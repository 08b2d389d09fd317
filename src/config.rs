//! Streaming server configuration.

use crate::{Error, Result};
use std::time::Duration;

/// Upper bound on `prefetch_blocks`.
///
/// Matches the inline capacity of the prefetch queue, so opening a stream
/// never allocates.
pub const MAX_PREFETCH_BLOCKS: usize = 32;

/// Configuration for the streaming server.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Number of request nodes preallocated at startup. Default: 128
    pub request_pool_capacity: usize,
    /// Number of streams that can be open at once. Default: 16
    pub max_streams: usize,
    /// Data block capacity in bytes. Default: 65536
    pub block_capacity: usize,
    /// Blocks requested ahead of the read/write position. Default: 20
    pub prefetch_blocks: usize,
    /// Worker wakeup timeout; bounds shutdown latency. Default: 1s
    pub worker_wait: Duration,
    /// When true, read/write return 0 while buffering instead of draining
    /// the reply queue. Default: false
    pub constant_time_polling: bool,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            request_pool_capacity: 128,
            max_streams: 16,
            block_capacity: 64 * 1024,
            prefetch_blocks: 20,
            worker_wait: Duration::from_secs(1),
            constant_time_polling: false,
        }
    }
}

impl SpoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_capacity == 0 {
            return Err(Error::InvalidConfig("block_capacity must be non-zero".into()));
        }
        if self.prefetch_blocks == 0 || self.prefetch_blocks > MAX_PREFETCH_BLOCKS {
            return Err(Error::InvalidConfig(format!(
                "prefetch_blocks {} out of range (1-{})",
                self.prefetch_blocks, MAX_PREFETCH_BLOCKS
            )));
        }
        if self.request_pool_capacity < self.prefetch_blocks + 1 {
            return Err(Error::InvalidConfig(format!(
                "request_pool_capacity {} too small for prefetch_blocks {} (need at least one open request plus one node per prefetched block)",
                self.request_pool_capacity, self.prefetch_blocks
            )));
        }
        if self.max_streams == 0 {
            return Err(Error::InvalidConfig("max_streams must be non-zero".into()));
        }
        Ok(())
    }
}
