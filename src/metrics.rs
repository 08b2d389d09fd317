//! I/O statistics for the worker thread.
//!
//! Tracks throughput and resource balance (blocks, files, nodes). The
//! balance counters make leak checks cheap in integration tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// I/O metrics for worker thread operations.
#[derive(Debug, Default)]
pub struct IoMetrics {
    /// Bytes read from disk
    bytes_read: AtomicU64,
    /// Bytes written to disk
    bytes_written: AtomicU64,
    /// Read operations count
    read_ops: AtomicU64,
    /// Write operations count
    write_ops: AtomicU64,
    /// Data blocks allocated by the worker
    blocks_allocated: AtomicU64,
    /// Data blocks freed by the worker
    blocks_freed: AtomicU64,
    /// Files opened successfully
    files_opened: AtomicU64,
    /// Files closed
    files_closed: AtomicU64,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_block_allocated(&self) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_block_freed(&self) {
        self.blocks_freed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_file_opened(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_file_closed(&self) {
        self.files_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current metrics.
    pub fn snapshot(&self) -> IoMetricsSnapshot {
        IoMetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            files_closed: self.files_closed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of I/O metrics at a point in time.
#[derive(Debug, Clone, Default)]
pub struct IoMetricsSnapshot {
    /// Bytes read from disk
    pub bytes_read: u64,
    /// Bytes written to disk
    pub bytes_written: u64,
    /// Read operations count
    pub read_ops: u64,
    /// Write operations count
    pub write_ops: u64,
    /// Data blocks allocated by the worker
    pub blocks_allocated: u64,
    /// Data blocks freed by the worker
    pub blocks_freed: u64,
    /// Files opened successfully
    pub files_opened: u64,
    /// Files closed
    pub files_closed: u64,
}

impl IoMetricsSnapshot {
    /// Data blocks currently held by clients or in flight.
    pub fn blocks_outstanding(&self) -> u64 {
        self.blocks_allocated - self.blocks_freed
    }

    /// Files currently open.
    pub fn files_open(&self) -> u64 {
        self.files_opened - self.files_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = IoMetrics::new();

        metrics.record_read(1024);
        metrics.record_read(2048);
        metrics.record_write(512);
        metrics.record_block_allocated();
        metrics.record_block_allocated();
        metrics.record_block_freed();
        metrics.record_file_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_read, 3072);
        assert_eq!(snapshot.bytes_written, 512);
        assert_eq!(snapshot.read_ops, 2);
        assert_eq!(snapshot.write_ops, 1);
        assert_eq!(snapshot.blocks_outstanding(), 1);
        assert_eq!(snapshot.files_open(), 1);
    }

    #[test]
    fn test_balanced_counters() {
        let metrics = IoMetrics::new();
        metrics.record_block_allocated();
        metrics.record_block_freed();
        metrics.record_file_opened();
        metrics.record_file_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.blocks_outstanding(), 0);
        assert_eq!(snapshot.files_open(), 0);
    }
}
