//! Partitioning filters.

/// Splits a parent buffer into contiguous child views
pub trait PartitionFilter: Send + Sync {
    /// Number of children produced for a parent of `parent_size` bytes
    fn nchildren(&self, parent_size: usize) -> usize;

    /// Byte range `(offset, len)` of child `index` inside the parent
    fn child_extent(&self, parent_size: usize, index: usize) -> (usize, usize);
}

/// Split into `nparts` contiguous blocks of near-equal size
///
/// The remainder is spread over the first blocks, one byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFilter {
    nparts: usize,
}

impl BlockFilter {
    /// Create a filter producing `nparts` blocks
    #[must_use]
    pub const fn new(nparts: usize) -> Self {
        Self { nparts }
    }
}

impl PartitionFilter for BlockFilter {
    fn nchildren(&self, _parent_size: usize) -> usize {
        self.nparts
    }

    fn child_extent(&self, parent_size: usize, index: usize) -> (usize, usize) {
        let base = parent_size / self.nparts;
        let rem = parent_size % self.nparts;
        let len = base + usize::from(index < rem);
        let offset = index * base + index.min(rem);
        (offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_even_split() {
        let filter = BlockFilter::new(4);
        assert_eq!(filter.nchildren(16), 4);
        assert_eq!(filter.child_extent(16, 0), (0, 4));
        assert_eq!(filter.child_extent(16, 3), (12, 4));
    }

    #[test]
    fn test_remainder_goes_first() {
        let filter = BlockFilter::new(3);
        assert_eq!(filter.child_extent(10, 0), (0, 4));
        assert_eq!(filter.child_extent(10, 1), (4, 3));
        assert_eq!(filter.child_extent(10, 2), (7, 3));
    }

    proptest::proptest! {
        #[test]
        fn test_blocks_tile_parent(size in 0usize..10_000, nparts in 1usize..64) {
            let filter = BlockFilter::new(nparts);
            let mut next = 0;
            for i in 0..filter.nchildren(size) {
                let (offset, len) = filter.child_extent(size, i);
                prop_assert_eq!(offset, next);
                next = offset + len;
            }
            prop_assert_eq!(next, size);
        }
    }
}
