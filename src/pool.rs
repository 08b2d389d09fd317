//! Fixed-capacity request node pool.
//!
//! All request nodes are created once at server start and recycled through
//! a lock-free free list. `allocate` returns `None` on exhaustion; callers
//! must initialise every field they rely on, nothing is cleared on the way
//! out.

use crate::request::IoRequest;
use crossbeam::queue::ArrayQueue;

pub(crate) struct RequestPool {
    free: ArrayQueue<Box<IoRequest>>,
    capacity: usize,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(Box::new(IoRequest::new_free()));
        }
        Self { free, capacity }
    }

    /// Take a node from the pool. Lock-free; `None` when the pool is empty.
    pub fn allocate(&self) -> Option<Box<IoRequest>> {
        self.free.pop()
    }

    /// Return a node to the pool, dropping whatever its payload still held.
    pub fn deallocate(&self, mut node: Box<IoRequest>) {
        node.reset();
        // At most `capacity` nodes exist, so the push cannot fail.
        let _ = self.free.push(node);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free nodes. Exact only while no allocation is in flight.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = RequestPool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_count(), 4);

        let mut taken = Vec::new();
        for _ in 0..4 {
            taken.push(pool.allocate().expect("pool should have free nodes"));
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.free_count(), 0);

        for node in taken {
            pool.deallocate(node);
        }
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_deallocate_resets() {
        let pool = RequestPool::new(1);
        let mut node = pool.allocate().unwrap();
        node.ticket = 99;
        node.status = -1;
        pool.deallocate(node);

        let node = pool.allocate().unwrap();
        assert_eq!(node.ticket, 0);
        assert_eq!(node.status, 0);
    }
}
