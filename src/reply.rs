//! Per-stream reply queues.
//!
//! Single producer (the worker), single consumer (the owning client).
//! Replies arrive in completion order, not submission order; the stream's
//! prefetch queue restores file order by matching tickets.
//!
//! The expected-reply counter is the contract between close and cleanup:
//! it equals increments at post time minus pops, so a stream can tell at
//! close whether replies are still in flight and must be handed to the
//! worker for disposal.

use crate::request::IoRequest;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug)]
pub(crate) struct ReplyQueue {
    queue: ArrayQueue<Box<IoRequest>>,
    expected: AtomicUsize,
    /// Set by the worker when the owning client is gone and replies remain
    /// in flight. Inspected by the worker before every push.
    awaiting_cleanup: AtomicBool,
}

impl ReplyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            expected: AtomicUsize::new(0),
            awaiting_cleanup: AtomicBool::new(false),
        }
    }

    /// Producer side. Returns the node on overflow so the caller can
    /// dispose of it; the queue is sized so this does not happen while
    /// node ownership is balanced.
    pub fn push(&self, node: Box<IoRequest>) -> Result<(), Box<IoRequest>> {
        self.queue.push(node)
    }

    /// Consumer side. A successful pop consumes one expected reply.
    pub fn pop(&self) -> Option<Box<IoRequest>> {
        let node = self.queue.pop()?;
        self.expected.fetch_sub(1, Ordering::AcqRel);
        Some(node)
    }

    /// Called by the client immediately after posting a request that will
    /// reply here.
    pub fn add_expected(&self) {
        self.expected.fetch_add(1, Ordering::AcqRel);
    }

    /// Consume one expected reply without a pop. Used by the worker when it
    /// disposes of a reply in place instead of delivering it.
    pub fn consume_expected(&self) {
        self.expected.fetch_sub(1, Ordering::AcqRel);
    }

    /// Roll back one expected reply after a failed post.
    pub fn cancel_expected(&self) {
        self.expected.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn expected(&self) -> usize {
        self.expected.load(Ordering::Acquire)
    }

    pub fn set_awaiting_cleanup(&self) {
        self.awaiting_cleanup.store(true, Ordering::Release);
    }

    pub fn is_awaiting_cleanup(&self) -> bool {
        self.awaiting_cleanup.load(Ordering::Acquire)
    }

    /// Prepare the queue for reuse by the next stream. Only valid once the
    /// expected count is zero and the queue is empty.
    pub fn recycle(&self) {
        debug_assert_eq!(self.expected(), 0);
        debug_assert!(self.queue.is_empty());
        self.awaiting_cleanup.store(false, Ordering::Release);
    }
}
