//! Read streams.

use super::{StreamInner, StreamState, TransferBuf};
use crate::error::{Error, Result};

/// A sequential block read stream.
///
/// Owned by a single thread; every operation is wait-free and safe to call
/// from an audio callback. The stream opens asynchronously: poll until the
/// state leaves [`StreamState::Opening`], seek, then read.
///
/// # Example
/// ```ignore
/// let mut stream = system.open_read("take_01.raw")?;
/// while stream.poll_state() == StreamState::Opening {}
/// stream.seek(0)?;
/// // from the callback:
/// let frames = stream.read(&mut interleaved, FRAME_BYTES);
/// ```
pub struct ReadStream {
    inner: StreamInner,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream").finish_non_exhaustive()
    }
}

impl ReadStream {
    pub(crate) fn new(inner: StreamInner) -> Self {
        Self { inner }
    }

    /// Flush the prefetch queue and start buffering from `pos`. Valid once
    /// the stream has opened.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(pos)
    }

    /// Read up to `dst.len() / item_size` whole items; returns the number
    /// of items transferred. `item_size` must divide the block capacity.
    ///
    /// Transfers nothing while opening, buffering (under the constant-time
    /// polling policy), at EOF, or after an error.
    pub fn read(&mut self, dst: &mut [u8], item_size: usize) -> usize {
        self.inner.transfer(TransferBuf::Read(dst), item_size)
    }

    /// Process at most one pending reply and return the current state.
    pub fn poll_state(&mut self) -> StreamState {
        self.inner.poll()
    }

    /// The error that moved the stream to [`StreamState::Error`], if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.error()
    }

    /// Close the stream. Outstanding requests are handed to the worker for
    /// cleanup; equivalent to dropping the stream.
    pub fn close(self) {}
}
