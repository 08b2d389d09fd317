//! Request nodes exchanged between clients and the I/O worker.
//!
//! A node carries a request to the worker and comes back as the reply; the
//! same box moves through the mailbox, the per-stream reply queue, and the
//! stream's prefetch queue, with exactly one owner at any time. Nodes are
//! recycled through the request pool and never freed while the server runs.

use crate::block::DataBlock;
use crate::reply::ReplyQueue;
use std::path::PathBuf;
use std::sync::Arc;

/// Opaque handle naming an open file inside the worker.
pub(crate) type FileId = u64;

/// Status codes riding on request nodes. Raw OS errno values, with `EIO`
/// as the fallback when the platform reports nothing specific.
pub(crate) mod status {
    pub const OK: i32 = 0;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
}

/// How a stream opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read-only.
    Read,
    /// Create or truncate, then read/write.
    ReadWriteOverwrite,
}

/// A request/reply node.
///
/// `ticket` identifies the prefetch-queue slot a block reply belongs to;
/// replies arrive out of order and are matched by identity, not position.
/// `bytes_copied` is client-side scratch tracking the intra-block copy
/// offset; the worker never touches it.
#[derive(Debug)]
pub(crate) struct IoRequest {
    pub ticket: u64,
    pub status: i32,
    pub bytes_copied: usize,
    pub payload: Payload,
}

/// Worker-facing variant payload. The discriminant is the request kind.
#[derive(Debug)]
pub(crate) enum Payload {
    /// The node is sitting in the pool.
    Free,
    OpenFile {
        path: Arc<PathBuf>,
        mode: OpenMode,
        file: Option<FileId>,
        reply: Arc<ReplyQueue>,
    },
    CloseFile {
        file: FileId,
    },
    ReadBlock {
        file: FileId,
        position: u64,
        block: Option<DataBlock>,
        eof: bool,
        reply: Arc<ReplyQueue>,
    },
    ReleaseReadBlock {
        file: FileId,
        block: DataBlock,
    },
    AllocateWriteBlock {
        file: FileId,
        position: u64,
        block: Option<DataBlock>,
        reply: Arc<ReplyQueue>,
    },
    CommitWriteBlock {
        file: FileId,
        position: u64,
        block: DataBlock,
    },
    ReleaseWriteBlock {
        file: FileId,
        block: DataBlock,
    },
}

impl IoRequest {
    pub fn new_free() -> Self {
        Self {
            ticket: 0,
            status: status::OK,
            bytes_copied: 0,
            payload: Payload::Free,
        }
    }

    /// Drop any resources the payload still holds and park the node.
    pub fn reset(&mut self) {
        self.ticket = 0;
        self.status = status::OK;
        self.bytes_copied = 0;
        self.payload = Payload::Free;
    }

    /// The data block attached to an acquire reply, if any.
    pub fn block(&self) -> Option<&DataBlock> {
        match &self.payload {
            Payload::ReadBlock { block, .. } | Payload::AllocateWriteBlock { block, .. } => {
                block.as_ref()
            }
            _ => None,
        }
    }

    pub fn block_mut(&mut self) -> Option<&mut DataBlock> {
        match &mut self.payload {
            Payload::ReadBlock { block, .. } | Payload::AllocateWriteBlock { block, .. } => {
                block.as_mut()
            }
            _ => None,
        }
    }

    /// Whether a read reply observed end-of-file. Always false for write
    /// blocks.
    pub fn is_at_eof(&self) -> bool {
        matches!(self.payload, Payload::ReadBlock { eof: true, .. })
    }

    /// Turn an acquire reply holding a block into the matching release
    /// request. Write blocks release as unmodified; committing is the
    /// separate, write-stream-only transform below.
    pub fn transform_to_release(&mut self) {
        self.payload = match std::mem::replace(&mut self.payload, Payload::Free) {
            Payload::ReadBlock {
                file,
                block: Some(block),
                ..
            } => Payload::ReleaseReadBlock { file, block },
            Payload::AllocateWriteBlock {
                file,
                block: Some(block),
                ..
            } => Payload::ReleaseWriteBlock { file, block },
            other => other,
        };
    }

    /// Turn a write-block reply into a commit request carrying the block's
    /// valid bytes back to its file position.
    pub fn transform_to_commit(&mut self) {
        self.payload = match std::mem::replace(&mut self.payload, Payload::Free) {
            Payload::AllocateWriteBlock {
                file,
                position,
                block: Some(block),
                ..
            } => Payload::CommitWriteBlock {
                file,
                position,
                block,
            },
            other => other,
        };
    }

    /// Turn a completed open reply into the close request for its file.
    pub fn transform_to_close(&mut self, file: FileId) {
        self.payload = Payload::CloseFile { file };
    }
}
