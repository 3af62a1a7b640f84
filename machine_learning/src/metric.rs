use ndarray::{ArrayView3, Zip};

use crate::{MlErr, Result};

/// Per-class Dice between a predicted and a ground truth label volume.
///
/// A class absent from both volumes of a sample is excluded from that sample's contribution
/// instead of counting as a perfect match.
#[derive(Debug, Clone, Copy)]
pub struct DiceMetric {
    num_classes: usize,
    smooth_nr: f32,
    smooth_dr: f32,
}

impl DiceMetric {
    pub fn new(num_classes: usize, smooth_nr: f32, smooth_dr: f32) -> Self {
        Self {
            num_classes,
            smooth_nr,
            smooth_dr,
        }
    }

    /// Scores one sample.
    ///
    /// # Arguments
    /// * `pred` - The predicted class per voxel.
    /// * `label` - The ground truth class per voxel.
    ///
    /// # Returns
    /// The sample's scores, every present class has a count of one.
    pub fn score(&self, pred: ArrayView3<u8>, label: ArrayView3<u8>) -> Result<ClassScores> {
        if pred.dim() != label.dim() {
            return Err(MlErr::ShapeMismatch {
                what: "prediction and label",
                got: pred.shape().to_vec(),
                expected: label.shape().to_vec(),
            });
        }

        let k = self.num_classes;
        let mut inter = vec![0u64; k];
        let mut pred_count = vec![0u64; k];
        let mut label_count = vec![0u64; k];

        let mut out_of_range = None;
        Zip::from(&pred).and(&label).for_each(|&p, &l| {
            let (pi, li) = (p as usize, l as usize);
            if pi >= k || li >= k {
                out_of_range = Some(p.max(l));
                return;
            }

            pred_count[pi] += 1;
            label_count[li] += 1;
            if pi == li {
                inter[pi] += 1;
            }
        });

        if let Some(label) = out_of_range {
            return Err(MlErr::LabelOutOfRange {
                label,
                num_classes: k,
            });
        }

        let mut scores = ClassScores::new(k);
        for c in 0..k {
            let total = pred_count[c] + label_count[c];
            if total == 0 {
                log::trace!(class = c; "class absent from prediction and label, excluded");
                continue;
            }

            let num = 2. * inter[c] as f32 + self.smooth_nr;
            let den = total as f32 + self.smooth_dr;
            scores.sums[c] = num / den;
            scores.counts[c] = 1.;
        }

        Ok(scores)
    }
}

/// Accumulated per-class Dice sums and the amount of samples each class was scored on.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores {
    sums: Vec<f32>,
    counts: Vec<f32>,
}

impl ClassScores {
    /// Creates empty scores for `num_classes` classes.
    pub fn new(num_classes: usize) -> Self {
        Self {
            sums: vec![0.; num_classes],
            counts: vec![0.; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.sums.len()
    }

    /// Adds `other`'s sums and counts into `self`.
    pub fn merge(&mut self, other: &ClassScores) -> Result<()> {
        if other.num_classes() != self.num_classes() {
            return Err(MlErr::SizeMismatch {
                what: "class scores",
                got: other.num_classes(),
                expected: self.num_classes(),
            });
        }

        self.sums.iter_mut().zip(&other.sums).for_each(|(a, b)| *a += b);
        self.counts.iter_mut().zip(&other.counts).for_each(|(a, b)| *a += b);
        Ok(())
    }

    /// Packs the scores as `[sums..., counts...]` so a single sum reduction merges them.
    pub fn to_flat(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(2 * self.num_classes());
        flat.extend_from_slice(&self.sums);
        flat.extend_from_slice(&self.counts);
        flat
    }

    /// Inverse of `to_flat`.
    pub fn from_flat(flat: &[f32]) -> Result<Self> {
        if flat.len() % 2 != 0 {
            return Err(MlErr::SizeMismatch {
                what: "flat class scores",
                got: flat.len(),
                expected: flat.len() + 1,
            });
        }

        let (sums, counts) = flat.split_at(flat.len() / 2);
        Ok(Self {
            sums: sums.to_vec(),
            counts: counts.to_vec(),
        })
    }

    /// The mean Dice of every class, `None` where a class was never scored.
    pub fn per_class(&self) -> Vec<Option<f32>> {
        self.sums
            .iter()
            .zip(&self.counts)
            .map(|(&s, &n)| (n > 0.).then(|| s / n))
            .collect()
    }

    /// The mean over every scored class-sample pair, `None` if nothing was scored.
    pub fn mean(&self) -> Option<f32> {
        let n: f32 = self.counts.iter().sum();
        (n > 0.).then(|| self.sums.iter().sum::<f32>() / n)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, array};

    use super::*;

    fn metric() -> DiceMetric {
        DiceMetric::new(3, 0., 1e-6)
    }

    #[test]
    fn absent_classes_are_excluded() {
        let pred = array![[[0u8, 0], [1, 1]]];
        let label = array![[[0u8, 0], [1, 0]]];

        let scores = metric().score(pred.view(), label.view()).unwrap();
        let per_class = scores.per_class();

        assert!((per_class[0].unwrap() - 4. / 5.).abs() < 1e-5);
        assert!((per_class[1].unwrap() - 2. / 3.).abs() < 1e-5);
        assert_eq!(per_class[2], None);
    }

    #[test]
    fn missed_class_scores_zero_not_excluded() {
        let pred = Array3::<u8>::zeros((1, 2, 2));
        let mut label = Array3::<u8>::zeros((1, 2, 2));
        label[[0, 1, 1]] = 2;

        let scores = metric().score(pred.view(), label.view()).unwrap();
        assert_eq!(scores.per_class()[2], Some(0.));
    }

    #[test]
    fn reduction_is_associative_across_partitions() {
        let samples: Vec<_> = (0..5u8)
            .map(|i| {
                let i = i as usize;
                let pred = Array3::from_shape_fn((2, 2, 2), |(a, b, c)| (a + b + c + i) as u8 % 3);
                let label = Array3::from_shape_fn((2, 2, 2), |(a, b, c)| (a * b + c + i) as u8 % 2);
                metric().score(pred.view(), label.view()).unwrap()
            })
            .collect();

        let mut whole = ClassScores::new(3);
        samples.iter().for_each(|s| whole.merge(s).unwrap());

        let mut left = ClassScores::new(3);
        let mut right = ClassScores::new(3);
        samples[..2].iter().for_each(|s| left.merge(s).unwrap());
        samples[2..].iter().for_each(|s| right.merge(s).unwrap());

        let reduced: Vec<f32> = left
            .to_flat()
            .iter()
            .zip(right.to_flat())
            .map(|(a, b)| a + b)
            .collect();
        let reduced = ClassScores::from_flat(&reduced).unwrap();

        assert_eq!(reduced.counts, whole.counts);
        let (a, b) = (reduced.mean().unwrap(), whole.mean().unwrap());
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn nothing_scored_has_no_mean() {
        assert_eq!(ClassScores::new(4).mean(), None);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let pred = Array3::<u8>::zeros((1, 2, 2));
        let label = Array3::<u8>::zeros((2, 2, 1));
        assert!(metric().score(pred.view(), label.view()).is_err());
    }
}
