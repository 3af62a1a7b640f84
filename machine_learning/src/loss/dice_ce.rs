use ndarray::{Array4, Array5, ArrayView4, ArrayView5, Axis, Zip, s};

use super::LossFn;
use crate::{MlErr, Result};

/// Soft Dice plus cross-entropy over softmax probabilities.
///
/// The Dice term is computed per sample and per class (background included) with the
/// squared prediction in the denominator:
///
/// `dice = (2 * Σ p g + smooth_nr) / (Σ p² + Σ g + smooth_dr)`
///
/// and averaged as `1 - dice` over samples and classes. The cross-entropy term is the mean
/// negative log-likelihood over every voxel. The loss is the sum of both.
#[derive(Debug, Clone, Copy)]
pub struct DiceCe {
    smooth_nr: f32,
    smooth_dr: f32,
}

impl DiceCe {
    /// Creates a new `DiceCe` loss.
    ///
    /// # Arguments
    /// * `smooth_nr` - Added to the Dice numerator.
    /// * `smooth_dr` - Added to the Dice denominator, must be positive so empty classes
    ///                 never divide by zero.
    pub fn new(smooth_nr: f32, smooth_dr: f32) -> Result<Self> {
        if !(smooth_dr > 0.) || !smooth_nr.is_finite() || smooth_nr < 0. {
            return Err(MlErr::InvalidArgument {
                what: "dice smoothing",
                reason: format!(
                    "smooth_nr must be >= 0 and smooth_dr > 0, got {smooth_nr} and {smooth_dr}"
                ),
            });
        }

        Ok(Self {
            smooth_nr,
            smooth_dr,
        })
    }
}

impl Default for DiceCe {
    fn default() -> Self {
        Self {
            smooth_nr: 0.,
            smooth_dr: 1e-6,
        }
    }
}

impl LossFn for DiceCe {
    fn loss_and_grad(
        &self,
        logits: ArrayView5<f32>,
        labels: ArrayView4<u8>,
    ) -> Result<(f32, Array5<f32>)> {
        let (b, k, d, h, w) = logits.dim();
        if labels.dim() != (b, d, h, w) {
            return Err(MlErr::ShapeMismatch {
                what: "labels",
                got: labels.shape().to_vec(),
                expected: vec![b, d, h, w],
            });
        }

        if let Some(&label) = labels.iter().find(|&&l| l as usize >= k) {
            return Err(MlErr::LabelOutOfRange {
                label,
                num_classes: k,
            });
        }

        let voxels = (d * h * w) as f32;
        let mut probs = Array5::<f32>::zeros(logits.raw_dim());
        let mut nll = Array4::<f32>::zeros(labels.raw_dim());

        Zip::from(probs.lanes_mut(Axis(1)))
            .and(logits.lanes(Axis(1)))
            .and(&labels)
            .and(&mut nll)
            .par_for_each(|mut p, z, &label, nll| {
                let max = z.fold(f32::NEG_INFINITY, |m, &z| m.max(z));
                p.zip_mut_with(&z, |p, &z| *p = (z - max).exp());
                let sum = p.sum();
                p /= sum;

                *nll = -(z[label as usize] - max - sum.ln());
            });

        let ce = nll.sum() / (b as f32 * voxels);

        // dL/dp of the Dice term
        let pairs = (b * k) as f32;
        let mut dice_loss = 0.;
        let mut dp = Array5::<f32>::zeros(logits.raw_dim());

        for bi in 0..b {
            let label = labels.slice(s![bi, .., .., ..]);

            for c in 0..k {
                let p = probs.slice(s![bi, c, .., .., ..]);

                let (mut inter, mut p_sq, mut g_sum) = (0., 0., 0.);
                Zip::from(&p).and(&label).for_each(|&p, &l| {
                    let g = (l as usize == c) as u8 as f32;
                    inter += p * g;
                    p_sq += p * p;
                    g_sum += g;
                });

                let num = 2. * inter + self.smooth_nr;
                let den = p_sq + g_sum + self.smooth_dr;
                dice_loss += 1. - num / den;

                let coef = -1. / (pairs * den * den);
                Zip::from(dp.slice_mut(s![bi, c, .., .., ..]))
                    .and(&p)
                    .and(&label)
                    .for_each(|dp, &p, &l| {
                        let g = (l as usize == c) as u8 as f32;
                        *dp = coef * (2. * g * den - num * 2. * p);
                    });
            }
        }

        let dice_loss = dice_loss / pairs;

        // Back through the softmax and add the cross-entropy gradient.
        let mut grad = Array5::<f32>::zeros(logits.raw_dim());
        let ce_scale = 1. / (b as f32 * voxels);

        Zip::from(grad.lanes_mut(Axis(1)))
            .and(probs.lanes(Axis(1)))
            .and(dp.lanes(Axis(1)))
            .and(&labels)
            .par_for_each(|mut g, p, dp, &label| {
                let dot = p.dot(&dp);
                Zip::from(&mut g)
                    .and(&p)
                    .and(&dp)
                    .for_each(|g, &p, &dp| *g = p * (dp - dot) + ce_scale * p);
                g[label as usize] -= ce_scale;
            });

        Ok((dice_loss + ce, grad))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    fn logits() -> Array5<f32> {
        Array::from_shape_fn((2, 3, 2, 2, 1), |(b, c, d, h, _)| {
            ((b * 11 + c * 7 + d * 3 + h) as f32 * 0.61).cos() * 2.
        })
    }

    fn labels() -> Array4<u8> {
        Array::from_shape_fn((2, 2, 2, 1), |(b, d, h, _)| ((b + d * 2 + h) % 3) as u8)
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let loss_fn = DiceCe::new(0., 1e-5).unwrap();
        let mut z = logits();
        let y = labels();

        let (_, grad) = loss_fn.loss_and_grad(z.view(), y.view()).unwrap();

        let h = 5e-3;
        for idx in ndarray::indices(z.raw_dim()) {
            let orig = z[idx];
            z[idx] = orig + h;
            let up = loss_fn.loss(z.view(), y.view()).unwrap();
            z[idx] = orig - h;
            let down = loss_fn.loss(z.view(), y.view()).unwrap();
            z[idx] = orig;

            let numeric = (up - down) / (2. * h);
            assert!(
                (numeric - grad[idx]).abs() < 3e-3,
                "{idx:?}: numeric {numeric} analytic {}",
                grad[idx]
            );
        }
    }

    #[test]
    fn empty_foreground_is_finite() {
        let loss_fn = DiceCe::default();
        let y = Array4::<u8>::zeros((2, 2, 2, 1));

        let (loss, grad) = loss_fn.loss_and_grad(logits().view(), y.view()).unwrap();
        assert!(loss.is_finite());
        assert!(grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn confident_correct_prediction_has_low_loss() {
        let y = labels();
        let z = Array::from_shape_fn((2, 3, 2, 2, 1), |(b, c, d, h, w)| {
            if y[[b, d, h, w]] as usize == c { 20. } else { -20. }
        });

        let loss = DiceCe::default().loss(z.view(), y.view()).unwrap();
        assert!(loss < 1e-3, "loss = {loss}");
    }

    #[test]
    fn labels_outside_the_class_range_are_rejected() {
        let mut y = labels();
        y[[0, 0, 0, 0]] = 3;
        assert!(matches!(
            DiceCe::default().loss(logits().view(), y.view()),
            Err(MlErr::LabelOutOfRange { label: 3, .. })
        ));
    }

    #[test]
    fn non_positive_denominator_smoothing_is_rejected() {
        assert!(DiceCe::new(0., 0.).is_err());
        assert!(DiceCe::new(-1., 1e-6).is_err());
    }
}
