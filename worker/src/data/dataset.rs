use ndarray::{Array3, Array4, Array5, ArrayView4, Axis, stack};

use crate::{Result, WorkerErr};

/// A labelled volume.
///
/// `image` is `[channel, d, h, w]`, `label` holds one class id per voxel of the same
/// spatial shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Array4<f32>,
    pub label: Array3<u8>,
}

impl Sample {
    pub fn new(image: Array4<f32>, label: Array3<u8>) -> Result<Self> {
        let spatial = &image.shape()[1..];
        if spatial != label.shape() {
            return Err(WorkerErr::BatchShape {
                got: label.shape().to_vec(),
                expected: spatial.to_vec(),
            });
        }

        Ok(Self { image, label })
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        let (_, d, h, w) = self.image.dim();
        [d, h, w]
    }
}

/// A minimal in-memory dataset.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the sample at `idx`, if any.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Sample> {
        self.samples.get(idx)
    }

    #[inline]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Samples of equal shape stacked along a leading batch axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Array5<f32>,
    pub labels: Array4<u8>,
}

impl Batch {
    /// Stacks `samples` into one batch.
    ///
    /// # Returns
    /// An error if `samples` is empty or their shapes differ.
    pub fn stack(samples: &[Sample]) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(WorkerErr::BatchShape {
                got: vec![0],
                expected: vec![1],
            });
        };

        if let Some(odd) = samples.iter().find(|s| s.image.shape() != first.image.shape()) {
            return Err(WorkerErr::BatchShape {
                got: odd.image.shape().to_vec(),
                expected: first.image.shape().to_vec(),
            });
        }

        let images: Vec<ArrayView4<f32>> = samples.iter().map(|s| s.image.view()).collect();
        let labels: Vec<_> = samples.iter().map(|s| s.label.view()).collect();

        Ok(Self {
            images: stack(Axis(0), &images).map_err(machine_learning::MlErr::from)?,
            labels: stack(Axis(0), &labels).map_err(machine_learning::MlErr::from)?,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f32) -> Sample {
        Sample::new(
            Array4::from_elem((1, 2, 2, 2), value),
            Array3::from_elem((2, 2, 2), 1),
        )
        .unwrap()
    }

    #[test]
    fn mismatched_label_is_rejected() {
        let res = Sample::new(Array4::zeros((1, 2, 2, 2)), Array3::zeros((2, 2, 3)));
        assert!(res.is_err());
    }

    #[test]
    fn batch_stacks_along_the_first_axis() {
        let batch = Batch::stack(&[sample(1.), sample(2.)]).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.shape(), &[2, 1, 2, 2, 2]);
        assert_eq!(batch.labels.shape(), &[2, 2, 2, 2]);
        assert_eq!(batch.images[[1, 0, 1, 1, 1]], 2.);
    }

    #[test]
    fn empty_batch_is_an_error() {
        assert!(Batch::stack(&[]).is_err());
    }
}
