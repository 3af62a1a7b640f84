use machine_learning::MlErr;
use ndarray::{Array3, Array4};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use super::{InMemoryDataset, Sample};
use crate::Result;

const NOISE_STD: f32 = 0.1;

/// Generates labelled phantom volumes: one sphere per foreground class over a noisy
/// background, with the image intensity tracking the class id.
#[derive(Debug, Clone)]
pub struct PhantomGenerator {
    volume: [usize; 3],
    in_channels: usize,
    num_classes: usize,
    rng: StdRng,
}

impl PhantomGenerator {
    pub fn new(volume: [usize; 3], in_channels: usize, num_classes: usize, seed: u64) -> Self {
        Self {
            volume,
            in_channels,
            num_classes,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self) -> Result<Sample> {
        let [d, h, w] = self.volume;
        let side = d.min(h).min(w) as f32;
        let mut label = Array3::<u8>::zeros((d, h, w));

        for class in 1..self.num_classes {
            let radius = self.rng.random_range(side / 8.0..=side / 4.0).max(1.0);
            let center = self.volume.map(|n| self.rng.random_range(0..n) as f32);

            label.indexed_iter_mut().for_each(|((z, y, x), l)| {
                let dist = [z, y, x]
                    .iter()
                    .zip(center)
                    .map(|(&p, c)| (p as f32 - c).powi(2))
                    .sum::<f32>();
                if dist <= radius * radius {
                    *l = class as u8;
                }
            });
        }

        let noise = Normal::new(0.0, NOISE_STD)
            .map_err(|e| MlErr::Distribution(e.to_string()))?;
        let levels = (self.num_classes - 1).max(1) as f32;
        let rng = &mut self.rng;

        let image = Array4::from_shape_fn((self.in_channels, d, h, w), |(c, z, y, x)| {
            let gain = 1.0 + 0.1 * c as f32;
            gain * label[[z, y, x]] as f32 / levels + noise.sample(rng)
        });

        Sample::new(image, label)
    }

    /// Generates `len` samples.
    pub fn dataset(&mut self, len: usize) -> Result<InMemoryDataset> {
        let samples = (0..len).map(|_| self.sample()).collect::<Result<_>>()?;
        Ok(InMemoryDataset::new(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_volumes() {
        let a = PhantomGenerator::new([8, 8, 8], 1, 3, 42).dataset(2).unwrap();
        let b = PhantomGenerator::new([8, 8, 8], 1, 3, 42).dataset(2).unwrap();
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn labels_stay_within_the_classes() {
        let sample = PhantomGenerator::new([12, 10, 8], 2, 4, 0).sample().unwrap();

        assert_eq!(sample.image.shape(), &[2, 12, 10, 8]);
        assert!(sample.label.iter().all(|&l| l < 4));
        assert!(sample.label.iter().any(|&l| l > 0));
    }
}
