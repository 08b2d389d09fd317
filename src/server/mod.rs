//! Streaming system facade: owns the request pool, the stream cores, the
//! mailbox, and the I/O worker thread.

mod thread;

use crate::config::SpoolConfig;
use crate::error::{Error, Result};
use crate::mailbox::Mailbox;
use crate::metrics::{IoMetrics, IoMetricsSnapshot};
use crate::pool::RequestPool;
use crate::reply::ReplyQueue;
use crate::request::OpenMode;
use crate::stream::{ReadStream, StreamInner, WriteStream};
use crossbeam::queue::ArrayQueue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// State shared between clients and the I/O worker.
pub(crate) struct ServerShared {
    pub config: SpoolConfig,
    pub pool: RequestPool,
    /// Recycled stream cores. Each core is one stream's reply queue.
    cores: ArrayQueue<Arc<ReplyQueue>>,
    pub mailbox: Mailbox,
    pub shutdown: AtomicBool,
    pub metrics: IoMetrics,
}

impl ServerShared {
    fn new(config: SpoolConfig, mailbox: Mailbox) -> Self {
        let pool = RequestPool::new(config.request_pool_capacity);
        let cores = ArrayQueue::new(config.max_streams);
        for _ in 0..config.max_streams {
            // Sized to the pool capacity so a worker push cannot overflow.
            let _ = cores.push(Arc::new(ReplyQueue::new(config.request_pool_capacity)));
        }
        Self {
            config,
            pool,
            cores,
            mailbox,
            shutdown: AtomicBool::new(false),
            metrics: IoMetrics::new(),
        }
    }

    pub fn acquire_core(&self) -> Option<Arc<ReplyQueue>> {
        self.cores.pop()
    }

    /// Return a fully drained core to the pool for the next stream.
    pub fn release_core(&self, core: Arc<ReplyQueue>) {
        core.recycle();
        let _ = self.cores.push(core);
    }
}

/// Asynchronous file streaming system.
///
/// Spawns a single I/O worker thread; clients open [`ReadStream`]s and
/// [`WriteStream`]s whose operations never block on disk I/O.
///
/// # Example
/// ```ignore
/// let system = SpoolSystem::builder().build()?;
/// let mut stream = system.open_read("audio.raw")?;
/// stream.seek(0)?;
/// // ...from the audio callback:
/// let frames = stream.read(&mut buf, 4);
/// ```
pub struct SpoolSystem {
    shared: Arc<ServerShared>,
    worker: Option<JoinHandle<()>>,
}

impl SpoolSystem {
    /// Create a new system builder.
    pub fn builder() -> SpoolSystemBuilder {
        SpoolSystemBuilder::default()
    }

    /// Open a file for sequential block reads.
    pub fn open_read(&self, path: impl Into<PathBuf>) -> Result<ReadStream> {
        Ok(ReadStream::new(self.open_stream(path.into(), OpenMode::Read)?))
    }

    /// Open a file for sequential block writes, truncating any existing
    /// content.
    pub fn open_write(&self, path: impl Into<PathBuf>) -> Result<WriteStream> {
        Ok(WriteStream::new(
            self.open_stream(path.into(), OpenMode::ReadWriteOverwrite)?,
        ))
    }

    fn open_stream(&self, path: PathBuf, mode: OpenMode) -> Result<StreamInner> {
        StreamInner::open(Arc::clone(&self.shared), Arc::new(path), mode)
    }

    /// Snapshot of worker I/O metrics.
    pub fn metrics(&self) -> IoMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Free nodes currently in the request pool.
    pub fn request_pool_free(&self) -> usize {
        self.shared.pool.free_count()
    }

    pub fn request_pool_capacity(&self) -> usize {
        self.shared.pool.capacity()
    }

    /// Stop the worker thread. Pending requests in the mailbox are drained
    /// before the thread exits. Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.shutdown.store(true, Ordering::Relaxed);
            self.shared.mailbox.post_shutdown();
            let _ = handle.join();
        }
    }
}

impl Drop for SpoolSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`SpoolSystem`].
#[derive(Debug, Default)]
pub struct SpoolSystemBuilder {
    config: SpoolConfig,
}

impl SpoolSystemBuilder {
    /// Number of request nodes preallocated at startup.
    pub fn request_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.request_pool_capacity = capacity;
        self
    }

    /// Number of streams that can be open at once.
    pub fn max_streams(mut self, streams: usize) -> Self {
        self.config.max_streams = streams;
        self
    }

    /// Data block capacity in bytes.
    pub fn block_capacity(mut self, bytes: usize) -> Self {
        self.config.block_capacity = bytes;
        self
    }

    /// Blocks requested ahead of the read/write position.
    pub fn prefetch_blocks(mut self, blocks: usize) -> Self {
        self.config.prefetch_blocks = blocks;
        self
    }

    /// Worker wakeup timeout.
    pub fn worker_wait(mut self, wait: std::time::Duration) -> Self {
        self.config.worker_wait = wait;
        self
    }

    /// Return 0 from read/write while buffering instead of draining the
    /// reply queue.
    pub fn constant_time_polling(mut self, enabled: bool) -> Self {
        self.config.constant_time_polling = enabled;
        self
    }

    /// Validate the configuration, allocate the pools, and spawn the
    /// worker thread.
    pub fn build(self) -> Result<SpoolSystem> {
        self.config.validate()?;

        let (mailbox, rx) = Mailbox::new(
            self.config.request_pool_capacity,
            self.config.max_streams,
        );
        let shared = Arc::new(ServerShared::new(self.config, mailbox));

        let worker = std::thread::Builder::new()
            .name("spool-io".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || thread::run(shared, rx)
            })
            .map_err(|_| Error::WorkerUnavailable)?;

        Ok(SpoolSystem {
            shared,
            worker: Some(worker),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_shared(
    config: SpoolConfig,
) -> (
    Arc<ServerShared>,
    crossbeam_channel::Receiver<crate::mailbox::ServerMessage>,
) {
    let (mailbox, rx) = Mailbox::new(config.request_pool_capacity, config.max_streams);
    (Arc::new(ServerShared::new(config, mailbox)), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = SpoolSystem::builder().block_capacity(0).build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_start_and_shutdown() {
        let mut system = SpoolSystem::builder()
            .request_pool_capacity(8)
            .prefetch_blocks(2)
            .build()
            .expect("system should start");

        assert_eq!(system.request_pool_free(), 8);
        system.shutdown();
        system.shutdown(); // idempotent
        assert_eq!(system.request_pool_free(), 8);
    }

    #[test]
    fn test_core_pool_bounds_open_streams() {
        let (shared, _rx) = test_shared(SpoolConfig {
            max_streams: 1,
            ..Default::default()
        });

        let core = shared.acquire_core().expect("one core available");
        assert!(shared.acquire_core().is_none());
        shared.release_core(core);
        assert!(shared.acquire_core().is_some());
    }
}
