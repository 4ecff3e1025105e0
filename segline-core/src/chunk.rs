//! Chunk arithmetic: segment counts, final index and offsets for a fixed chunk size.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;

/// Chunk size actually used; zero falls back to the default.
pub fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Number of segments needed for `total_len` bytes. An exact multiple of the chunk
/// size never produces a trailing empty segment.
pub fn segment_count(total_len: u64, chunk_size: u64) -> u64 {
    total_len.div_ceil(effective_chunk_size(chunk_size))
}

/// Highest valid segment index, `-1` when there is nothing to send.
pub fn final_segment(total_len: u64, chunk_size: u64) -> i64 {
    segment_count(total_len, chunk_size) as i64 - 1
}

/// Byte offset of segment `n`, or `None` on overflow.
pub fn segment_offset(n: u64, chunk_size: u64) -> Option<u64> {
    n.checked_mul(effective_chunk_size(chunk_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_segment_boundaries() {
        assert_eq!(final_segment(0, 4096), -1);
        assert_eq!(final_segment(1, 4096), 0);
        assert_eq!(final_segment(12, 4096), 0);
        assert_eq!(final_segment(4096, 4096), 0);
        assert_eq!(final_segment(4097, 4096), 1);
        assert_eq!(final_segment(40_000, 4096), 9);
        assert_eq!(final_segment(8192, 4096), 1);
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        assert_eq!(effective_chunk_size(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(segment_count(10_000, 0), 3);
    }

    #[test]
    fn offsets() {
        assert_eq!(segment_offset(3, 100), Some(300));
        assert_eq!(segment_offset(u64::MAX, 2), None);
    }
}
