//! Fixed-capacity data blocks.

/// A fixed-capacity byte buffer representing one aligned chunk of a file.
///
/// Blocks are allocated and freed only by the I/O worker; a client borrows
/// a block through an acquire reply and returns it with a release or commit
/// request. `valid` counts the bytes that hold file data.
#[derive(Debug)]
pub struct DataBlock {
    data: Box<[u8]>,
    valid: usize,
}

impl DataBlock {
    pub(crate) fn allocate(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            valid: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn valid(&self) -> usize {
        self.valid
    }

    /// Set the valid-byte count. `valid` must not exceed the capacity.
    #[inline]
    pub(crate) fn set_valid(&mut self, valid: usize) {
        debug_assert!(valid <= self.data.len());
        self.valid = valid;
    }

    /// The valid bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.valid]
    }

    /// The whole buffer, including bytes beyond the valid count.
    #[inline]
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate() {
        let block = DataBlock::allocate(4096);
        assert_eq!(block.capacity(), 4096);
        assert_eq!(block.valid(), 0);
        assert!(block.bytes().is_empty());
    }

    #[test]
    fn test_valid_window() {
        let mut block = DataBlock::allocate(16);
        block.buffer_mut()[..4].copy_from_slice(b"abcd");
        block.set_valid(4);
        assert_eq!(block.bytes(), b"abcd");
    }
}
