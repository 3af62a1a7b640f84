use std::vec;

use super::{Augmenter, Batch, DistributedSampler, InMemoryDataset};
use crate::Result;

/// Rank-aware loader stacking (optionally augmented) samples into batches.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: InMemoryDataset,
    sampler: DistributedSampler,
    batch_size: usize,
    augmenter: Option<Augmenter>,
}

impl DataLoader {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The full dataset, shared by every rank.
    /// * `sampler` - Picks this rank's indices each epoch.
    /// * `batch_size` - The amount of samples per batch, the last one may be smaller.
    /// * `augmenter` - Applied to every sample, needed when the samples aren't patch sized.
    pub fn new(
        dataset: InMemoryDataset,
        sampler: DistributedSampler,
        batch_size: usize,
        augmenter: Option<Augmenter>,
    ) -> Self {
        Self {
            dataset,
            sampler,
            batch_size: batch_size.max(1),
            augmenter,
        }
    }

    /// The amount of batches in an epoch.
    pub fn num_batches(&self) -> usize {
        self.sampler.indices(0).len().div_ceil(self.batch_size)
    }

    /// Iterates over this rank's batches of `epoch`.
    pub fn batches(&mut self, epoch: usize) -> Batches<'_> {
        Batches {
            indices: self.sampler.indices(epoch).into_iter(),
            loader: self,
        }
    }
}

/// The batches of one epoch.
pub struct Batches<'a> {
    loader: &'a mut DataLoader,
    indices: vec::IntoIter<usize>,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let DataLoader {
            dataset,
            batch_size,
            augmenter,
            ..
        } = &mut *self.loader;
        let dataset = &*dataset;

        let picked: Vec<usize> = self.indices.by_ref().take(*batch_size).collect();
        if picked.is_empty() {
            return None;
        }

        let samples = picked
            .into_iter()
            .filter_map(|idx| dataset.get(idx))
            .map(|sample| match augmenter.as_mut() {
                Some(augmenter) => augmenter.apply(sample),
                None => Ok(sample.clone()),
            })
            .collect::<Result<Vec<_>>>();

        Some(samples.and_then(|samples| Batch::stack(&samples)))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, Array4};

    use super::*;
    use crate::data::Sample;

    fn dataset(len: usize) -> InMemoryDataset {
        let samples = (0..len)
            .map(|i| {
                Sample::new(
                    Array4::from_elem((1, 2, 2, 2), i as f32),
                    Array3::zeros((2, 2, 2)),
                )
                .unwrap()
            })
            .collect();
        InMemoryDataset::new(samples)
    }

    #[test]
    fn last_batch_may_be_smaller() {
        let sampler = DistributedSampler::train(5, 0, 1, 0);
        let mut loader = DataLoader::new(dataset(5), sampler, 2, None);

        let sizes: Vec<usize> = loader.batches(0).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn every_rank_gets_the_same_batch_shapes() {
        let shapes: Vec<Vec<Vec<usize>>> = (0..2)
            .map(|rank| {
                let sampler = DistributedSampler::train(5, rank, 2, 3);
                let mut loader = DataLoader::new(dataset(5), sampler, 2, None);
                loader
                    .batches(1)
                    .map(|b| b.unwrap().images.shape().to_vec())
                    .collect()
            })
            .collect();

        assert_eq!(shapes[0], shapes[1]);
    }
}
