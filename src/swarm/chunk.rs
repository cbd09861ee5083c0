use std::ops::Range;

/// Number of chunks a file of `file_size` bytes splits into. An empty file
/// still counts as one (empty) chunk.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    debug_assert!(chunk_size > 0);
    std::cmp::max(1, file_size.div_ceil(chunk_size))
}

/// Byte range covered by `chunk_id`, or `None` when the id is out of range.
pub fn chunk_range(chunk_id: u64, chunk_size: u64, file_size: u64) -> Option<Range<u64>> {
    if chunk_id >= total_chunks(file_size, chunk_size) {
        return None;
    }
    let start = chunk_id * chunk_size;
    let end = std::cmp::min(start + chunk_size, file_size);
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_has_one_chunk() {
        assert_eq!(total_chunks(0, 512), 1);
        assert_eq!(chunk_range(0, 512, 0), Some(0..0));
        assert_eq!(chunk_range(1, 512, 0), None);
    }

    #[test]
    fn total_chunks_is_ceiling() {
        for (size, expected) in [(1, 1), (511, 1), (512, 1), (513, 2), (1024, 2), (1025, 3)] {
            assert_eq!(total_chunks(size, 512), expected, "size {}", size);
        }
    }

    #[test]
    fn ranges_cover_file_exactly() {
        let size = 1300;
        let chunks = total_chunks(size, 512);
        let mut next = 0;
        for id in 0..chunks {
            let range = chunk_range(id, 512, size).unwrap();
            assert_eq!(range.start, next);
            assert!(range.end - range.start <= 512);
            next = range.end;
        }
        assert_eq!(next, size);
        assert_eq!(chunk_range(2, 512, size), Some(1024..1300));
        assert_eq!(chunk_range(chunks, 512, size), None);
    }
}
