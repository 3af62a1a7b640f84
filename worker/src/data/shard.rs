use std::ops::Range;

/// Splits `total` samples among `world_size` ranks and returns the shard of `rank`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1 (balanced partition).
/// - A rank may get an empty range when `total < world_size`.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    if rank >= world_size {
        return total..total;
    }

    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let extra = if rank < rem { 1 } else { 0 };
    let end = start + base + extra;

    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_range_balanced() {
        // total 10, ranks 3 => sizes 4,3,3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn fewer_samples_than_ranks_leaves_empty_shards() {
        assert_eq!(shard_range(1, 0, 2), 0..1);
        assert_eq!(shard_range(1, 1, 2), 1..1);
    }
}
