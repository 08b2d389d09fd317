//! Write streams.

use super::{StreamInner, StreamState, TransferBuf};
use crate::error::{Error, Result};

/// A sequential block write stream.
///
/// Same shape as [`ReadStream`](crate::ReadStream); blocks are acquired
/// with their existing file content so unaligned writes read-modify-write
/// correctly. Blocks the stream wrote into are committed back to disk when
/// the write position passes them or when the stream closes; untouched
/// blocks are released unmodified.
pub struct WriteStream {
    inner: StreamInner,
}

impl WriteStream {
    pub(crate) fn new(inner: StreamInner) -> Self {
        Self { inner }
    }

    /// Flush the prefetch queue and start buffering write blocks at `pos`.
    /// Valid once the stream has opened.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(pos)
    }

    /// Write up to `src.len() / item_size` whole items; returns the number
    /// of items transferred. `item_size` must divide the block capacity.
    pub fn write(&mut self, src: &[u8], item_size: usize) -> usize {
        self.inner.transfer(TransferBuf::Write(src), item_size)
    }

    /// Process at most one pending reply and return the current state.
    pub fn poll_state(&mut self) -> StreamState {
        self.inner.poll()
    }

    /// The error that moved the stream to [`StreamState::Error`], if any.
    ///
    /// Commit failures are reported here on a later write, once the worker
    /// surfaces them on the next block acquire for this file.
    pub fn error(&self) -> Option<Error> {
        self.inner.error()
    }

    /// Close the stream, committing any modified blocks still held.
    /// Equivalent to dropping the stream.
    pub fn close(self) {}
}
