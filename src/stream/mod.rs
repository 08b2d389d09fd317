//! Client-side stream state machine.
//!
//! A stream owns a pooled reply queue (its "core"), the retained open-file
//! request node, and a prefetch queue of outstanding block requests in
//! ascending file-position order. Every operation polls the reply queue, so
//! progress is made even when the caller only reads. All operations are
//! wait-free: bounded atomic work plus bounded copying, no blocking, no
//! heap allocation.

mod read;
mod write;

pub use read::ReadStream;
pub use write::WriteStream;

use crate::config::MAX_PREFETCH_BLOCKS;
use crate::error::{Error, Result};
use crate::reply::ReplyQueue;
use crate::request::{status, FileId, IoRequest, OpenMode, Payload};
use crate::server::ServerShared;
use smallvec::SmallVec;
use std::path::PathBuf;
use std::sync::Arc;

/// Observable stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The open request has been posted and no reply has arrived yet.
    Opening,
    /// Open succeeded; no seek has been issued. Reads and writes transfer
    /// nothing in this state.
    Idle,
    /// Block requests are outstanding and the head of the prefetch queue
    /// is not ready yet.
    Buffering,
    /// The head block is ready; reads and writes transfer data.
    Streaming,
    /// A read consumed the final block of the file.
    Eof,
    /// The stream failed. Sticky until close; see
    /// [`ReadStream::error`](crate::ReadStream::error).
    Error,
}

/// One outstanding block request, in file order.
struct PrefetchSlot {
    ticket: u64,
    position: u64,
    /// Intra-block offset the first copy skips; non-zero only for the
    /// block containing an unaligned seek target.
    skip: usize,
    modified: bool,
    state: SlotState,
}

enum SlotState {
    /// Awaiting the worker's reply.
    Pending,
    /// Block received; the node (and its block) is owned by the stream.
    Ready(Box<IoRequest>),
    /// The worker replied with an error; the node went back to the pool.
    Error(i32),
}

/// Direction of a block copy.
pub(crate) enum TransferBuf<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl TransferBuf<'_> {
    fn len(&self) -> usize {
        match self {
            TransferBuf::Read(buf) => buf.len(),
            TransferBuf::Write(buf) => buf.len(),
        }
    }
}

struct CopyOutcome {
    n: usize,
    wrote: bool,
    block_end: bool,
    final_end: bool,
}

enum StepAction {
    HeadPending,
    HeadError(i32),
    Copy(CopyOutcome),
}

pub(crate) struct StreamInner {
    shared: Arc<ServerShared>,
    /// `None` once closed.
    core: Option<Arc<ReplyQueue>>,
    /// The open-file node, kept for the stream's lifetime; close turns it
    /// into the close request.
    open_req: Option<Box<IoRequest>>,
    file: Option<FileId>,
    mode: OpenMode,
    state: StreamState,
    error: Option<Error>,
    prefetch: SmallVec<[PrefetchSlot; MAX_PREFETCH_BLOCKS]>,
    /// Pending slots currently in the prefetch queue.
    waiting_for_blocks: usize,
    next_ticket: u64,
}

impl StreamInner {
    /// Allocate a node and a core, post the open request, and return the
    /// stream in `Opening`.
    pub fn open(shared: Arc<ServerShared>, path: Arc<PathBuf>, mode: OpenMode) -> Result<Self> {
        let Some(mut node) = shared.pool.allocate() else {
            return Err(Error::PoolExhausted);
        };
        let Some(core) = shared.acquire_core() else {
            shared.pool.deallocate(node);
            return Err(Error::PoolExhausted);
        };

        node.ticket = 0;
        node.status = status::OK;
        node.bytes_copied = 0;
        node.payload = Payload::OpenFile {
            path,
            mode,
            file: None,
            reply: Arc::clone(&core),
        };

        core.add_expected();
        if let Err(node) = shared.mailbox.post(node) {
            core.cancel_expected();
            shared.pool.deallocate(node);
            shared.release_core(core);
            return Err(Error::WorkerUnavailable);
        }

        Ok(Self {
            shared,
            core: Some(core),
            open_req: None,
            file: None,
            mode,
            state: StreamState::Opening,
            error: None,
            prefetch: SmallVec::new(),
            waiting_for_blocks: 0,
            next_ticket: 1,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn error(&self) -> Option<Error> {
        self.error.clone()
    }

    /// Process at most one reply and return the current state.
    pub fn poll(&mut self) -> StreamState {
        let Some(core) = self.core.clone() else {
            return self.state;
        };

        if core.expected() > 0 {
            if self.state == StreamState::Opening {
                // The only possible reply while opening is the open itself.
                if let Some(reply) = core.pop() {
                    if reply.status == status::OK {
                        if let Payload::OpenFile { file, .. } = &reply.payload {
                            self.file = *file;
                        }
                        self.state = StreamState::Idle;
                    } else {
                        self.error = Some(Error::Open { code: reply.status });
                        self.state = StreamState::Error;
                    }
                    self.open_req = Some(reply);
                }
            } else {
                self.receive_one();
            }
        }

        self.state
    }

    /// Flush the prefetch queue and request `prefetch_blocks` consecutive
    /// blocks starting at the block containing `pos`.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if self.core.is_none() {
            return Err(Error::Closed);
        }
        match self.state {
            StreamState::Opening => return Err(Error::NotReady),
            StreamState::Error => return Err(self.error.clone().unwrap_or(Error::NotReady)),
            _ => {}
        }

        self.flush_prefetch();

        let block_capacity = self.shared.config.block_capacity as u64;
        let aligned = (pos / block_capacity) * block_capacity;

        // The first block records the intra-block offset so the first copy
        // skips the prefix.
        self.push_acquire(aligned, (pos - aligned) as usize)?;
        for i in 1..self.shared.config.prefetch_blocks {
            self.push_acquire(aligned + i as u64 * block_capacity, 0)?;
        }

        self.state = StreamState::Buffering;
        Ok(())
    }

    /// Copy bytes between the user buffer and the prefetch queue's head
    /// blocks. Returns whole items transferred.
    pub fn transfer(&mut self, mut buf: TransferBuf<'_>, item_size: usize) -> usize {
        if item_size == 0 {
            return 0;
        }
        // Items must not span blocks.
        debug_assert_eq!(self.shared.config.block_capacity % item_size, 0);

        self.poll();

        match self.state {
            StreamState::Opening
            | StreamState::Idle
            | StreamState::Eof
            | StreamState::Error => return 0,
            StreamState::Buffering => {
                if self.shared.config.constant_time_polling {
                    return 0;
                }
                // Drain the reply queue to leave buffering as quickly as
                // possible.
                while self.receive_one() {}
                if self.state != StreamState::Streaming {
                    return 0;
                }
            }
            StreamState::Streaming => {}
        }

        let total = (buf.len() / item_size) * item_size;
        let mut copied = 0;

        while copied < total {
            // Last effort to have the head ready before giving up on this
            // call.
            while matches!(
                self.prefetch.first().map(|slot| &slot.state),
                Some(SlotState::Pending)
            ) {
                if !self.receive_one() {
                    break;
                }
            }

            let action = self.step(&mut buf, copied, total);

            match action {
                StepAction::HeadPending => {
                    self.state = StreamState::Buffering;
                    break;
                }
                StepAction::HeadError(code) => {
                    let err = match self.mode {
                        OpenMode::Read => Error::Read { code },
                        OpenMode::ReadWriteOverwrite => Error::Write { code },
                    };
                    self.fail(err);
                    break;
                }
                StepAction::Copy(outcome) => {
                    copied += outcome.n;
                    if outcome.wrote {
                        self.prefetch[0].modified = true;
                    }
                    if outcome.final_end {
                        self.state = StreamState::Eof;
                        break;
                    }
                    if outcome.block_end && !self.advance_head() {
                        break;
                    }
                }
            }
        }

        copied / item_size
    }

    /// Consult the head slot and copy what it allows.
    fn step(&mut self, buf: &mut TransferBuf<'_>, copied: usize, total: usize) -> StepAction {
        let capacity = self.shared.config.block_capacity;
        let is_write = self.mode == OpenMode::ReadWriteOverwrite;

        let Some(head) = self.prefetch.first_mut() else {
            return StepAction::HeadPending;
        };

        match &mut head.state {
            SlotState::Pending => StepAction::HeadPending,
            SlotState::Error(code) => StepAction::HeadError(*code),
            SlotState::Ready(node) => {
                let offset = node.bytes_copied;
                let at_eof = node.is_at_eof();
                let valid = node.block().map(|b| b.valid()).unwrap_or(0);

                let remaining = if is_write {
                    capacity - offset
                } else {
                    valid.saturating_sub(offset)
                };
                let n = remaining.min(total - copied);

                if n > 0 {
                    if let Some(block) = node.block_mut() {
                        match buf {
                            TransferBuf::Read(dst) => dst[copied..copied + n]
                                .copy_from_slice(&block.bytes()[offset..offset + n]),
                            TransferBuf::Write(src) => {
                                block.buffer_mut()[offset..offset + n]
                                    .copy_from_slice(&src[copied..copied + n]);
                                if offset + n > block.valid() {
                                    block.set_valid(offset + n);
                                }
                            }
                        }
                    }
                    node.bytes_copied += n;
                }

                let end = node.bytes_copied;
                let block_end = if is_write {
                    end == capacity
                } else {
                    end >= valid
                };

                StepAction::Copy(CopyOutcome {
                    n,
                    wrote: is_write && n > 0,
                    block_end,
                    final_end: block_end && at_eof,
                })
            }
        }
    }

    /// Issue the next sequential block request, then retire the head. The
    /// replacement is linked before the head is unlinked so the queue
    /// never empties mid-stream.
    fn advance_head(&mut self) -> bool {
        let block_capacity = self.shared.config.block_capacity as u64;
        let Some(tail_position) = self.prefetch.last().map(|slot| slot.position) else {
            return false;
        };

        if self.push_acquire(tail_position + block_capacity, 0).is_err() {
            return false;
        }

        let head = self.prefetch.remove(0);
        self.flush_slot(head);

        // Pick up one of the blocks requested earlier, if it has landed.
        self.receive_one();
        true
    }

    /// Pop one reply and route it: promote the matching prefetch slot, or
    /// dispose of a reply whose slot was flushed before it arrived.
    fn receive_one(&mut self) -> bool {
        let Some(core) = self.core.clone() else {
            return false;
        };
        let Some(mut reply) = core.pop() else {
            return false;
        };

        let slot_idx = self.prefetch.iter().position(|slot| {
            slot.ticket == reply.ticket && matches!(slot.state, SlotState::Pending)
        });

        match slot_idx {
            Some(idx) => {
                self.waiting_for_blocks -= 1;
                if self.waiting_for_blocks == 0 && self.state == StreamState::Buffering {
                    self.state = StreamState::Streaming;
                }

                if reply.status == status::OK {
                    reply.bytes_copied = self.prefetch[idx].skip;
                    self.prefetch[idx].state = SlotState::Ready(reply);
                } else {
                    self.prefetch[idx].state = SlotState::Error(reply.status);
                    self.shared.pool.deallocate(reply);
                }
            }
            None => {
                // Discarded: the slot was flushed while the request was in
                // flight. Hand any block straight back; errors on
                // discarded blocks don't touch the stream state.
                if reply.status == status::OK && reply.block().is_some() {
                    reply.transform_to_release();
                    if let Err(reply) = self.shared.mailbox.post(reply) {
                        self.shared.pool.deallocate(reply);
                    }
                } else {
                    self.shared.pool.deallocate(reply);
                }
            }
        }

        true
    }

    fn push_acquire(&mut self, position: u64, skip: usize) -> Result<()> {
        let (Some(file), Some(core)) = (self.file, self.core.clone()) else {
            return Err(Error::Closed);
        };
        let Some(mut node) = self.shared.pool.allocate() else {
            self.fail(Error::PoolExhausted);
            return Err(Error::PoolExhausted);
        };

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        node.ticket = ticket;
        node.status = status::OK;
        node.bytes_copied = 0;
        node.payload = match self.mode {
            OpenMode::Read => Payload::ReadBlock {
                file,
                position,
                block: None,
                eof: false,
                reply: Arc::clone(&core),
            },
            OpenMode::ReadWriteOverwrite => Payload::AllocateWriteBlock {
                file,
                position,
                block: None,
                reply: Arc::clone(&core),
            },
        };

        core.add_expected();
        if let Err(node) = self.shared.mailbox.post(node) {
            core.cancel_expected();
            self.shared.pool.deallocate(node);
            self.fail(Error::WorkerUnavailable);
            return Err(Error::WorkerUnavailable);
        }

        self.prefetch.push(PrefetchSlot {
            ticket,
            position,
            skip,
            modified: false,
            state: SlotState::Pending,
        });
        self.waiting_for_blocks += 1;
        Ok(())
    }

    fn flush_prefetch(&mut self) {
        while !self.prefetch.is_empty() {
            let slot = self.prefetch.remove(0);
            self.flush_slot(slot);
        }
    }

    /// Retire one slot: forget a pending request (its reply will miss the
    /// ticket scan and be disposed of), return a held block, or nothing
    /// for an error slot whose node is already back in the pool.
    fn flush_slot(&mut self, slot: PrefetchSlot) {
        match slot.state {
            SlotState::Pending => {
                self.waiting_for_blocks -= 1;
            }
            SlotState::Ready(mut node) => {
                if slot.modified {
                    node.transform_to_commit();
                } else {
                    node.transform_to_release();
                }
                if let Err(node) = self.shared.mailbox.post(node) {
                    self.shared.pool.deallocate(node);
                }
            }
            SlotState::Error(_) => {}
        }
    }

    fn fail(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.state = StreamState::Error;
    }

    /// Release everything this stream holds. Requests still in flight are
    /// handed to the worker with the reply queue for deferred cleanup.
    pub fn close(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };

        if self.state == StreamState::Opening {
            // The open reply is still in flight; the worker disposes of it
            // when it drains the queue.
            self.shared.mailbox.post_cleanup(core);
            return;
        }

        self.flush_prefetch();
        debug_assert_eq!(self.waiting_for_blocks, 0);

        if let Some(mut open_req) = self.open_req.take() {
            match self.file {
                Some(file) => {
                    open_req.transform_to_close(file);
                    if let Err(node) = self.shared.mailbox.post(open_req) {
                        self.shared.pool.deallocate(node);
                    }
                }
                None => self.shared.pool.deallocate(open_req),
            }
        }

        if core.expected() == 0 {
            self.shared.release_core(core);
        } else {
            self.shared.mailbox.post_cleanup(core);
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DataBlock;
    use crate::config::SpoolConfig;
    use crate::mailbox::ServerMessage;
    use crate::server::test_shared;
    use crossbeam_channel::Receiver;

    fn small_config() -> SpoolConfig {
        SpoolConfig {
            request_pool_capacity: 16,
            max_streams: 2,
            block_capacity: 16,
            prefetch_blocks: 3,
            ..Default::default()
        }
    }

    fn pop_request(rx: &Receiver<ServerMessage>) -> Box<IoRequest> {
        match rx.try_recv().expect("mailbox should hold a message") {
            ServerMessage::Request(node) => node,
            _ => panic!("expected a request message"),
        }
    }

    /// Complete an open request in place of the worker.
    fn serve_open(node: &mut IoRequest, result: std::result::Result<FileId, i32>) {
        match result {
            Ok(id) => {
                node.status = status::OK;
                if let Payload::OpenFile { file, .. } = &mut node.payload {
                    *file = Some(id);
                }
            }
            Err(code) => node.status = code,
        }
    }

    /// Complete a read-block request in place of the worker, serving bytes
    /// from `data`.
    fn serve_read(node: &mut IoRequest, data: &[u8], capacity: usize) {
        if let Payload::ReadBlock {
            position,
            block,
            eof,
            ..
        } = &mut node.payload
        {
            let start = (*position as usize).min(data.len());
            let end = (start + capacity).min(data.len());
            let mut b = DataBlock::allocate(capacity);
            b.buffer_mut()[..end - start].copy_from_slice(&data[start..end]);
            b.set_valid(end - start);
            *eof = end - start < capacity;
            *block = Some(b);
            node.status = status::OK;
        }
    }

    fn reply_queue_of(node: &IoRequest) -> Arc<ReplyQueue> {
        match &node.payload {
            Payload::OpenFile { reply, .. }
            | Payload::ReadBlock { reply, .. }
            | Payload::AllocateWriteBlock { reply, .. } => Arc::clone(reply),
            _ => panic!("request has no reply queue"),
        }
    }

    fn deliver(node: Box<IoRequest>) {
        let reply = reply_queue_of(&node);
        reply.push(node).unwrap();
    }

    fn open_served(
        shared: &Arc<crate::server::ServerShared>,
        rx: &Receiver<ServerMessage>,
    ) -> StreamInner {
        let mut stream = StreamInner::open(
            Arc::clone(shared),
            Arc::new(PathBuf::from("test.raw")),
            OpenMode::Read,
        )
        .unwrap();
        assert_eq!(stream.poll(), StreamState::Opening);

        let mut node = pop_request(rx);
        serve_open(&mut node, Ok(1));
        deliver(node);

        assert_eq!(stream.poll(), StreamState::Idle);
        stream
    }

    #[test]
    fn test_open_failure_reaches_error_state() {
        let (shared, rx) = test_shared(small_config());
        let mut stream = StreamInner::open(
            Arc::clone(&shared),
            Arc::new(PathBuf::from("missing.raw")),
            OpenMode::Read,
        )
        .unwrap();

        let mut node = pop_request(&rx);
        serve_open(&mut node, Err(2));
        deliver(node);

        assert_eq!(stream.poll(), StreamState::Error);
        assert_eq!(stream.error(), Some(Error::Open { code: 2 }));
        assert!(stream.seek(0).is_err());
    }

    #[test]
    fn test_seek_buffers_then_streams() {
        let (shared, rx) = test_shared(small_config());
        let data: Vec<u8> = (0..64u8).collect();

        let mut stream = open_served(&shared, &rx);
        stream.seek(0).unwrap();
        assert_eq!(stream.state(), StreamState::Buffering);

        for _ in 0..3 {
            let mut node = pop_request(&rx);
            serve_read(&mut node, &data, 16);
            deliver(node);
        }

        let mut out = [0u8; 32];
        let n = stream.transfer(TransferBuf::Read(&mut out), 1);
        assert_eq!(n, 32);
        assert_eq!(out[..], data[..32]);
        assert_eq!(stream.state(), StreamState::Streaming);
    }

    #[test]
    fn test_unaligned_seek_skips_prefix() {
        let (shared, rx) = test_shared(small_config());
        let data: Vec<u8> = (0..64u8).collect();

        let mut stream = open_served(&shared, &rx);
        stream.seek(21).unwrap();

        for _ in 0..3 {
            let mut node = pop_request(&rx);
            serve_read(&mut node, &data, 16);
            deliver(node);
        }

        let mut out = [0u8; 8];
        let n = stream.transfer(TransferBuf::Read(&mut out), 1);
        assert_eq!(n, 8);
        assert_eq!(out[..], data[21..29]);
    }

    #[test]
    fn test_error_on_third_block() {
        let (shared, rx) = test_shared(small_config());
        let data = [0xABu8; 64];

        let mut stream = open_served(&shared, &rx);
        stream.seek(0).unwrap();

        // Two good blocks, then a failed read.
        for i in 0..3 {
            let mut node = pop_request(&rx);
            if i < 2 {
                serve_read(&mut node, &data, 16);
            } else {
                node.status = status::EIO;
            }
            deliver(node);
        }

        let mut out = [0u8; 64];
        let n = stream.transfer(TransferBuf::Read(&mut out), 1);

        // Only the two good blocks are returned; the error block carries
        // no data.
        assert_eq!(n, 32);
        assert_eq!(stream.state(), StreamState::Error);
        assert_eq!(stream.error(), Some(Error::Read { code: status::EIO }));
    }

    #[test]
    fn test_eof_block_ends_stream() {
        let (shared, rx) = test_shared(small_config());
        let data = [1u8; 10]; // shorter than one block

        let mut stream = open_served(&shared, &rx);
        stream.seek(0).unwrap();

        for _ in 0..3 {
            let mut node = pop_request(&rx);
            serve_read(&mut node, &data, 16);
            deliver(node);
        }

        let mut out = [0u8; 32];
        let n = stream.transfer(TransferBuf::Read(&mut out), 1);
        assert_eq!(n, 10);
        assert_eq!(stream.state(), StreamState::Eof);

        // Reads at EOF transfer nothing.
        let n = stream.transfer(TransferBuf::Read(&mut out), 1);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_flushed_pending_reply_is_discarded() {
        let (shared, rx) = test_shared(small_config());
        let data = [7u8; 64];

        let mut stream = open_served(&shared, &rx);
        stream.seek(0).unwrap();
        let first_batch: Vec<_> = (0..3).map(|_| pop_request(&rx)).collect();

        // Re-seek before any reply arrives: the pending slots are flushed
        // and their replies must be routed back to the worker.
        stream.seek(0).unwrap();
        let _second_batch: Vec<_> = (0..3).map(|_| pop_request(&rx)).collect();

        for mut node in first_batch {
            serve_read(&mut node, &data, 16);
            deliver(node);
        }
        for _ in 0..3 {
            stream.poll();
        }

        // Each discarded block came back as a release request.
        let mut releases = 0;
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::Request(node) = msg {
                assert!(matches!(node.payload, Payload::ReleaseReadBlock { .. }));
                releases += 1;
            }
        }
        assert_eq!(releases, 3);
    }

    #[test]
    fn test_close_while_opening_posts_cleanup() {
        let (shared, rx) = test_shared(small_config());
        let mut stream = StreamInner::open(
            Arc::clone(&shared),
            Arc::new(PathBuf::from("test.raw")),
            OpenMode::Read,
        )
        .unwrap();

        let _open_req = pop_request(&rx);
        stream.close();

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Cleanup(_)
        ));
    }

    #[test]
    fn test_clean_close_recycles_core() {
        let (shared, rx) = test_shared(small_config());
        let mut stream = open_served(&shared, &rx);
        stream.close();

        // The open node became a close request and the core went back to
        // the pool without worker involvement.
        assert!(matches!(
            pop_request(&rx).payload,
            Payload::CloseFile { file: 1 }
        ));
        assert_eq!(shared.pool.free_count(), shared.pool.capacity() - 1);
    }

    #[test]
    fn test_pool_exhaustion_fails_stream() {
        let config = SpoolConfig {
            request_pool_capacity: 4,
            prefetch_blocks: 3,
            max_streams: 2,
            block_capacity: 16,
            ..Default::default()
        };
        let (shared, rx) = test_shared(config);

        let mut stream = open_served(&shared, &rx);

        // Drain the pool so the seek cannot refill the prefetch queue.
        let hostage = shared.pool.allocate().unwrap();
        let hostage2 = shared.pool.allocate().unwrap();
        let hostage3 = shared.pool.allocate().unwrap();

        assert_eq!(stream.seek(0), Err(Error::PoolExhausted));
        assert_eq!(stream.state(), StreamState::Error);
        assert_eq!(stream.error(), Some(Error::PoolExhausted));

        shared.pool.deallocate(hostage);
        shared.pool.deallocate(hostage2);
        shared.pool.deallocate(hostage3);
    }
}
