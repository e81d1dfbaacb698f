//! Layout footprints.
//!
//! A footprint summarises the shape of a data object (not its contents) so
//! that performance history recorded for one task applies to every task
//! touching data of the same shape.

use blake3::Hasher;

fn truncate(hash: &blake3::Hash) -> u32 {
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Footprint of a buffer of `size` bytes at partition depth `depth`
#[must_use]
pub fn layout_footprint(size: usize, depth: u32) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&(size as u64).to_le_bytes());
    hasher.update(&depth.to_le_bytes());
    truncate(&hasher.finalize())
}

/// Footprint of a task from the footprints of its buffers, in order
#[must_use]
pub fn combine(footprints: &[u32]) -> u32 {
    let mut hasher = Hasher::new();
    for fp in footprints {
        hasher.update(&fp.to_le_bytes());
    }
    truncate(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footprint_is_deterministic() {
        assert_eq!(layout_footprint(1024, 0), layout_footprint(1024, 0));
        assert_ne!(layout_footprint(1024, 0), layout_footprint(2048, 0));
        assert_ne!(layout_footprint(1024, 0), layout_footprint(1024, 1));
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        let a = layout_footprint(8, 0);
        let b = layout_footprint(16, 0);
        assert_eq!(combine(&[a, b]), combine(&[a, b]));
        assert_ne!(combine(&[a, b]), combine(&[b, a]));
    }
}
