//! Client-to-worker mailbox.
//!
//! Multi-producer/single-consumer FIFO. The channel's own wakeup replaces a
//! separate signalling primitive: the worker parks in `recv_timeout` and a
//! post from any client wakes it. Requests posted from one thread are
//! processed in post order.

use crate::reply::ReplyQueue;
use crate::request::IoRequest;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;

/// A message delivered to the I/O worker.
pub(crate) enum ServerMessage {
    /// A pooled request node.
    Request(Box<IoRequest>),
    /// A reply queue abandoned by its client with replies still expected.
    Cleanup(Arc<ReplyQueue>),
    /// Wake the worker so it can observe the shutdown flag.
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct Mailbox {
    tx: Sender<ServerMessage>,
}

impl Mailbox {
    /// Sized so that every pooled node, one cleanup per stream, and a
    /// shutdown message can be in flight at once; a post of a pooled node
    /// can then only fail once the worker is gone.
    pub fn new(request_capacity: usize, max_streams: usize) -> (Self, Receiver<ServerMessage>) {
        let (tx, rx) = bounded(request_capacity + max_streams + 1);
        (Self { tx }, rx)
    }

    /// Post a request node. On failure the node is handed back so the
    /// caller can return it to the pool.
    pub fn post(&self, node: Box<IoRequest>) -> Result<(), Box<IoRequest>> {
        self.tx
            .try_send(ServerMessage::Request(node))
            .map_err(|err| match err.into_inner() {
                ServerMessage::Request(node) => node,
                _ => unreachable!("post only sends Request messages"),
            })
    }

    /// Hand an abandoned reply queue to the worker for deferred cleanup.
    pub fn post_cleanup(&self, reply: Arc<ReplyQueue>) -> bool {
        self.tx.try_send(ServerMessage::Cleanup(reply)).is_ok()
    }

    pub fn post_shutdown(&self) {
        let _ = self.tx.try_send(ServerMessage::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_receive_in_order() {
        let (mailbox, rx) = Mailbox::new(8, 2);

        for ticket in 0..3 {
            let mut node = Box::new(IoRequest::new_free());
            node.ticket = ticket;
            mailbox.post(node).unwrap();
        }

        for expected in 0..3 {
            match rx.try_recv().unwrap() {
                ServerMessage::Request(node) => assert_eq!(node.ticket, expected),
                _ => panic!("expected a request message"),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_post_fails_after_receiver_dropped() {
        let (mailbox, rx) = Mailbox::new(4, 1);
        drop(rx);

        let node = Box::new(IoRequest::new_free());
        assert!(mailbox.post(node).is_err());
        assert!(!mailbox.post_cleanup(Arc::new(ReplyQueue::new(1))));
    }
}
