use ndarray::{Array, Array3, Array4, Axis, Dimension, s};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::Sample;
use crate::{Result, config::AugmentConfig};

/// Largest relative change of the intensity scaling.
const SCALE_FACTOR: f32 = 0.1;
/// Largest absolute change of the intensity shift.
const SHIFT_OFFSET: f32 = 0.1;

/// Turns a full training volume into a randomly augmented patch of the model's input size.
///
/// Per sample: pads every axis shorter than the ROI symmetrically, crops an ROI sized
/// patch centred on a foreground voxel half of the time (on any voxel otherwise), flips
/// each axis, rotates by quarter turns in the (h, w) plane, then scales and shifts the
/// intensities, each with its own probability.
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentConfig,
    roi: [usize; 3],
    rng: StdRng,
}

impl Augmenter {
    pub fn new(config: AugmentConfig, roi: [usize; 3], seed: u64) -> Self {
        Self {
            config,
            roi,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Produces an augmented ROI patch of `sample`.
    pub fn apply(&mut self, sample: &Sample) -> Result<Sample> {
        let Sample { mut image, mut label } = self.crop(&pad_to(sample, self.roi))?;

        for axis in 0..3 {
            if self.rng.random::<f32>() < self.config.flip_prob {
                image.invert_axis(Axis(axis + 1));
                label.invert_axis(Axis(axis));
            }
        }

        if self.rng.random::<f32>() < self.config.rot90_prob {
            let [_, h, w] = self.roi;
            // odd turns of a non square plane would change the patch shape
            let turns = if h == w { self.rng.random_range(1..=3) } else { 2 };
            for _ in 0..turns {
                rot90(&mut image, Axis(2), Axis(3));
                rot90(&mut label, Axis(1), Axis(2));
            }
            image = image.as_standard_layout().into_owned();
            label = label.as_standard_layout().into_owned();
        }

        if self.rng.random::<f32>() < self.config.scale_intensity_prob {
            let factor = 1. + self.rng.random_range(-SCALE_FACTOR..SCALE_FACTOR);
            image.mapv_inplace(|v| v * factor);
        }

        if self.rng.random::<f32>() < self.config.shift_intensity_prob {
            let offset = self.rng.random_range(-SHIFT_OFFSET..SHIFT_OFFSET);
            image.mapv_inplace(|v| v + offset);
        }

        Sample::new(image, label)
    }

    fn crop(&mut self, sample: &Sample) -> Result<Sample> {
        let shape = sample.spatial_shape();
        let center = if self.rng.random::<bool>() {
            self.foreground_voxel(&sample.label)
        } else {
            None
        };
        let center = center.unwrap_or_else(|| shape.map(|n| self.rng.random_range(0..n)));

        let mut origin = [0; 3];
        for axis in 0..3 {
            let half = self.roi[axis] / 2;
            let max = shape[axis] - self.roi[axis];
            origin[axis] = center[axis].saturating_sub(half).min(max);
        }

        let [z, y, x] = origin;
        let [rd, rh, rw] = self.roi;
        let image = sample
            .image
            .slice(s![.., z..z + rd, y..y + rh, x..x + rw])
            .to_owned();
        let label = sample
            .label
            .slice(s![z..z + rd, y..y + rh, x..x + rw])
            .to_owned();

        Sample::new(image, label)
    }

    /// A uniformly drawn voxel with a non background label, if the volume has any.
    fn foreground_voxel(&mut self, label: &Array3<u8>) -> Option<[usize; 3]> {
        let count = label.iter().filter(|&&l| l > 0).count();
        if count == 0 {
            return None;
        }

        let nth = self.rng.random_range(0..count);
        label
            .indexed_iter()
            .filter(|(_, l)| **l > 0)
            .nth(nth)
            .map(|((z, y, x), _)| [z, y, x])
    }
}

/// Turns `a` a quarter turn in the plane of `first` and `second`.
fn rot90<A, D: Dimension>(a: &mut Array<A, D>, first: Axis, second: Axis) {
    a.swap_axes(first.index(), second.index());
    a.invert_axis(first);
}

/// Zero pads every spatial axis of `sample` shorter than `roi`, splitting the padding
/// evenly between both ends.
fn pad_to(sample: &Sample, roi: [usize; 3]) -> Sample {
    let shape = sample.spatial_shape();
    if (0..3).all(|i| shape[i] >= roi[i]) {
        return sample.clone();
    }

    let padded = [0, 1, 2].map(|i| shape[i].max(roi[i]));
    let before = [0, 1, 2].map(|i| (padded[i] - shape[i]) / 2);
    let channels = sample.image.len_of(Axis(0));

    let mut image = Array4::zeros((channels, padded[0], padded[1], padded[2]));
    let mut label = Array3::zeros(padded);

    let [z, y, x] = before;
    let [d, h, w] = shape;
    image
        .slice_mut(s![.., z..z + d, y..y + h, x..x + w])
        .assign(&sample.image);
    label
        .slice_mut(s![z..z + d, y..y + h, x..x + w])
        .assign(&sample.label);

    Sample { image, label }
}
