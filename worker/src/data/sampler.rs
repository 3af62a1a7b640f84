use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::shard_range;

/// Picks the dataset indices a rank visits in an epoch.
///
/// Every rank shuffles with the same seed, so the per-epoch permutation is shared and each
/// rank takes every `world_size`-th index of it. With padding the permutation is extended
/// by wrapping around until every rank gets the same amount of indices, which keeps the
/// amount of training steps (and so of gradient reductions) equal across ranks.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    pad: bool,
    seed: u64,
}

impl DistributedSampler {
    /// Creates the training sampler of `rank`, shuffled and padded.
    pub fn train(len: usize, rank: usize, world_size: usize, seed: u64) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            shuffle: true,
            pad: true,
            seed,
        }
    }

    /// Creates the validation sampler of `rank`: a contiguous, unpadded shard, so no
    /// sample is scored twice.
    pub fn validation(len: usize, rank: usize, world_size: usize) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            shuffle: false,
            pad: false,
            seed: 0,
        }
    }

    /// The amount of indices each rank gets per epoch with padding.
    pub fn per_rank(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    /// The indices this rank visits during `epoch`.
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        if !self.pad {
            return shard_range(self.len, self.rank, self.world_size).collect();
        }

        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        if self.len == 0 {
            return order;
        }

        let total = self.per_rank() * self.world_size;
        let padded = order.iter().copied().cycle().take(total);

        padded.skip(self.rank).step_by(self.world_size).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ranks_draw_equal_counts_and_cover_everything() {
        let world_size = 3;
        let samplers: Vec<_> = (0..world_size)
            .map(|rank| DistributedSampler::train(10, rank, world_size, 7))
            .collect();

        let draws: Vec<Vec<usize>> = samplers.iter().map(|s| s.indices(0)).collect();
        assert!(draws.iter().all(|d| d.len() == 4));

        let seen: HashSet<usize> = draws.iter().flatten().copied().collect();
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn shuffle_is_shared_and_changes_per_epoch() {
        let a = DistributedSampler::train(32, 0, 2, 1);
        let b = DistributedSampler::train(32, 1, 2, 1);

        let (a0, b0) = (a.indices(0), b.indices(0));
        let overlap = a0.iter().filter(|i| b0.contains(i)).count();
        assert_eq!(overlap, 0);

        assert_eq!(a.indices(0), a0);
        assert_ne!(a.indices(1), a0);
    }

    #[test]
    fn validation_shards_are_contiguous_and_unpadded() {
        let first = DistributedSampler::validation(3, 0, 2);
        let second = DistributedSampler::validation(3, 1, 2);

        assert_eq!(first.indices(5), vec![0, 1]);
        assert_eq!(second.indices(5), vec![2]);
    }
}
