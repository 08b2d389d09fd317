//! The I/O worker thread.
//!
//! A single thread owns every open file and performs all blocking work.
//! It parks on the mailbox with a bounded timeout, drains it completely on
//! each wakeup so request bursts coalesce, and dispatches on the request
//! kind. Replies go back through the posting stream's reply queue unless
//! that queue has been abandoned, in which case the reply is disposed of
//! in place.

use crate::block::DataBlock;
use crate::mailbox::ServerMessage;
use crate::reply::ReplyQueue;
use crate::request::{status, FileId, IoRequest, OpenMode, Payload};
use crate::server::ServerShared;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Worker-private record of an open file.
struct FileRecord {
    file: File,
    /// One for the open handle plus one per block a client holds.
    dependent_clients: usize,
    /// First commit failure; surfaced as the status of the next acquire
    /// reply for this file.
    write_error: i32,
}

struct Worker {
    shared: Arc<ServerShared>,
    files: HashMap<FileId, FileRecord>,
    next_file_id: FileId,
}

pub(super) fn run(shared: Arc<ServerShared>, rx: Receiver<ServerMessage>) {
    info!("spool I/O worker started");

    let mut worker = Worker {
        shared,
        files: HashMap::new(),
        next_file_id: 1,
    };

    loop {
        match rx.recv_timeout(worker.shared.config.worker_wait) {
            Ok(msg) => worker.handle(msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Drain the mailbox completely so a burst coalesces to one wakeup.
        while let Ok(msg) = rx.try_recv() {
            worker.handle(msg);
        }

        if worker.shared.shutdown.load(Ordering::Relaxed) {
            while let Ok(msg) = rx.try_recv() {
                worker.handle(msg);
            }
            break;
        }
    }

    info!("spool I/O worker stopped");
}

impl Worker {
    fn handle(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request(node) => self.dispatch(node),
            ServerMessage::Cleanup(reply) => self.handle_cleanup(reply),
            ServerMessage::Shutdown => {}
        }
    }

    fn dispatch(&mut self, node: Box<IoRequest>) {
        match node.payload {
            Payload::OpenFile { .. } => self.handle_open(node),
            Payload::CloseFile { .. } => self.handle_close(node),
            Payload::ReadBlock { .. } => self.handle_read(node),
            Payload::AllocateWriteBlock { .. } => self.handle_allocate_write(node),
            Payload::CommitWriteBlock { .. } => self.handle_commit(node),
            Payload::ReleaseReadBlock { .. } | Payload::ReleaseWriteBlock { .. } => {
                self.handle_release(node)
            }
            Payload::Free => self.shared.pool.deallocate(node),
        }
    }

    fn handle_open(&mut self, mut node: Box<IoRequest>) {
        let (path, mode, reply) = match &node.payload {
            Payload::OpenFile {
                path, mode, reply, ..
            } => (Arc::clone(path), *mode, Arc::clone(reply)),
            _ => return self.shared.pool.deallocate(node),
        };

        let opened = match mode {
            OpenMode::Read => File::open(path.as_ref()),
            OpenMode::ReadWriteOverwrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path.as_ref()),
        };

        match opened {
            Ok(file) => {
                let id = self.next_file_id;
                self.next_file_id += 1;
                self.files.insert(
                    id,
                    FileRecord {
                        file,
                        dependent_clients: 1,
                        write_error: status::OK,
                    },
                );
                self.shared.metrics.record_file_opened();
                node.status = status::OK;
                if let Payload::OpenFile { file, .. } = &mut node.payload {
                    *file = Some(id);
                }
                debug!(path = %path.display(), id, "opened");
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "open failed");
                node.status = errno(&err);
            }
        }

        self.complete(&reply, node);
    }

    fn handle_close(&mut self, mut node: Box<IoRequest>) {
        if let Payload::CloseFile { file } = std::mem::replace(&mut node.payload, Payload::Free) {
            self.release_file_ref(file);
        }
        self.shared.pool.deallocate(node);
    }

    fn handle_read(&mut self, mut node: Box<IoRequest>) {
        let (file_id, position, reply) = match &node.payload {
            Payload::ReadBlock {
                file,
                position,
                reply,
                ..
            } => (*file, *position, Arc::clone(reply)),
            _ => return self.shared.pool.deallocate(node),
        };

        match self.files.get_mut(&file_id) {
            None => node.status = status::EBADF,
            Some(record) => {
                let mut block = DataBlock::allocate(self.shared.config.block_capacity);
                self.shared.metrics.record_block_allocated();

                match read_block_at(&mut record.file, position, block.buffer_mut()) {
                    Ok((count, eof)) => {
                        block.set_valid(count);
                        self.shared.metrics.record_read(count as u64);
                        node.status = status::OK;
                        if let Payload::ReadBlock {
                            block: slot,
                            eof: at_eof,
                            ..
                        } = &mut node.payload
                        {
                            *slot = Some(block);
                            *at_eof = eof;
                        }
                        record.dependent_clients += 1;
                    }
                    Err(err) => {
                        warn!(position, error = %err, "block read failed");
                        node.status = errno(&err);
                        drop(block);
                        self.shared.metrics.record_block_freed();
                    }
                }
            }
        }

        self.complete(&reply, node);
    }

    fn handle_allocate_write(&mut self, mut node: Box<IoRequest>) {
        let (file_id, position, reply) = match &node.payload {
            Payload::AllocateWriteBlock {
                file,
                position,
                reply,
                ..
            } => (*file, *position, Arc::clone(reply)),
            _ => return self.shared.pool.deallocate(node),
        };

        match self.files.get_mut(&file_id) {
            None => node.status = status::EBADF,
            Some(record) if record.write_error != status::OK => {
                // Surface an earlier commit failure on this acquire.
                node.status = record.write_error;
            }
            Some(record) => {
                let mut block = DataBlock::allocate(self.shared.config.block_capacity);
                self.shared.metrics.record_block_allocated();

                // Read back any existing content at the block's position so
                // read-modify-write of an existing file works.
                match read_block_at(&mut record.file, position, block.buffer_mut()) {
                    Ok((count, _eof)) => {
                        block.set_valid(count);
                        if count > 0 {
                            self.shared.metrics.record_read(count as u64);
                        }
                        node.status = status::OK;
                        if let Payload::AllocateWriteBlock { block: slot, .. } = &mut node.payload {
                            *slot = Some(block);
                        }
                        // Before completing: once the reply is pushed the
                        // client may release the block at any moment.
                        record.dependent_clients += 1;
                    }
                    Err(err) => {
                        warn!(position, error = %err, "write block allocation failed");
                        node.status = errno(&err);
                        drop(block);
                        self.shared.metrics.record_block_freed();
                    }
                }
            }
        }

        self.complete(&reply, node);
    }

    fn handle_commit(&mut self, mut node: Box<IoRequest>) {
        if let Payload::CommitWriteBlock {
            file,
            position,
            block,
        } = std::mem::replace(&mut node.payload, Payload::Free)
        {
            if let Some(record) = self.files.get_mut(&file) {
                match write_block_at(&mut record.file, position, block.bytes()) {
                    Ok(()) => self.shared.metrics.record_write(block.valid() as u64),
                    Err(err) => {
                        warn!(position, error = %err, "block commit failed");
                        if record.write_error == status::OK {
                            record.write_error = errno(&err);
                        }
                    }
                }
            }
            drop(block);
            self.shared.metrics.record_block_freed();
            self.release_file_ref(file);
        }
        self.shared.pool.deallocate(node);
    }

    fn handle_release(&mut self, mut node: Box<IoRequest>) {
        match std::mem::replace(&mut node.payload, Payload::Free) {
            Payload::ReleaseReadBlock { file, block } | Payload::ReleaseWriteBlock { file, block } => {
                drop(block);
                self.shared.metrics.record_block_freed();
                self.release_file_ref(file);
            }
            _ => {}
        }
        self.shared.pool.deallocate(node);
    }

    /// Drain and dispose an abandoned reply queue. If replies are still in
    /// flight the queue is parked; `complete` resumes the cleanup when the
    /// stragglers arrive.
    fn handle_cleanup(&mut self, reply: Arc<ReplyQueue>) {
        if reply.expected() > 0 {
            while let Some(node) = reply.pop() {
                self.dispose(node);
            }
            if reply.expected() == 0 {
                self.shared.release_core(reply);
            } else {
                reply.set_awaiting_cleanup();
            }
        } else {
            self.shared.release_core(reply);
        }
    }

    /// Deliver a reply, or dispose of it if the stream is gone. The
    /// cleanup state must be inspected before the push: after the push the
    /// queue belongs to the client again.
    fn complete(&mut self, reply: &Arc<ReplyQueue>, node: Box<IoRequest>) {
        if reply.is_awaiting_cleanup() {
            self.dispose(node);
            reply.consume_expected();
            if reply.expected() == 0 {
                self.shared.release_core(Arc::clone(reply));
            }
        } else if let Err(node) = reply.push(node) {
            // The queue is sized to the pool capacity; overflow means the
            // ownership invariant is already broken. Dispose rather than
            // leak.
            self.dispose(node);
            reply.consume_expected();
        }
    }

    /// Release whatever an undelivered reply carried, then recycle the
    /// node.
    fn dispose(&mut self, mut node: Box<IoRequest>) {
        match std::mem::replace(&mut node.payload, Payload::Free) {
            Payload::OpenFile { file: Some(id), .. } => self.release_file_ref(id),
            Payload::ReadBlock {
                file,
                block: Some(block),
                ..
            }
            | Payload::AllocateWriteBlock {
                file,
                block: Some(block),
                ..
            } => {
                drop(block);
                self.shared.metrics.record_block_freed();
                self.release_file_ref(file);
            }
            _ => {}
        }
        self.shared.pool.deallocate(node);
    }

    fn release_file_ref(&mut self, id: FileId) {
        if let Some(record) = self.files.get_mut(&id) {
            record.dependent_clients -= 1;
            if record.dependent_clients == 0 {
                self.files.remove(&id);
                self.shared.metrics.record_file_closed();
            }
        }
    }
}

fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(status::EIO)
}

/// Seek and fill `buf` from `position`. Returns the byte count and whether
/// end-of-file was reached before the buffer filled.
fn read_block_at(file: &mut File, position: u64, buf: &mut [u8]) -> io::Result<(usize, bool)> {
    file.seek(SeekFrom::Start(position))?;

    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Ok((filled, true)),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok((filled, false))
}

fn write_block_at(file: &mut File, position: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(position))?;
    file.write_all(bytes)
}
