//! Real-time-safe asynchronous file streaming.
//!
//! A single I/O worker thread owns all open files and performs every
//! blocking operation; clients talk to it exclusively through lock-free
//! queues backed by a fixed pool of request nodes. Stream reads and writes
//! are wait-free and allocation-free, so they can run inside an audio
//! callback while the worker prefetches blocks from disk.
//!
//! # Primary API
//!
//! - [`SpoolSystem`] / [`SpoolSystemBuilder`]: server lifecycle
//! - [`ReadStream`] / [`WriteStream`]: per-file streaming handles
//! - [`SpoolConfig`]: block size, prefetch depth, pool capacity
//! - [`IoMetricsSnapshot`]: worker-side I/O statistics
//!
//! # Example
//!
//! ```ignore
//! use spool::{SpoolSystem, StreamState};
//!
//! let system = SpoolSystem::builder().build()?;
//!
//! let mut stream = system.open_read("take_01.raw")?;
//! while stream.poll_state() == StreamState::Opening {
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! stream.seek(0)?;
//!
//! // In the audio callback: wait-free, returns whole frames only.
//! let frames = stream.read(&mut buf, FRAME_BYTES);
//! ```

// Error types
pub mod error;
pub use error::{Error, Result};

// Configuration
mod config;
pub use config::{SpoolConfig, MAX_PREFETCH_BLOCKS};

// Main entry point
mod server;
pub use server::{SpoolSystem, SpoolSystemBuilder};

// Streams
mod stream;
pub use stream::{ReadStream, StreamState, WriteStream};

// Worker metrics
mod metrics;
pub use metrics::IoMetricsSnapshot;

// Open modes
pub use request::OpenMode;

// Internal plumbing
mod block;
mod mailbox;
mod pool;
mod reply;
mod request;

pub use block::DataBlock;
