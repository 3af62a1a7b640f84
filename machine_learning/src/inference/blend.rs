use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// How a patch's logits are weighted when stitched into the full volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Every voxel of a patch weighs the same.
    #[default]
    Constant,
    /// Voxels near the patch centre weigh more, tapering towards the edges.
    Gaussian,
}

/// Builds the per-voxel blend weights of one patch.
///
/// Gaussian weights use `sigma = 0.125 * roi` per axis, are normalized to a peak of 1 and
/// floored at their smallest positive value, so every weight is strictly positive.
pub fn blend_weights(roi: [usize; 3], mode: BlendMode) -> Array3<f32> {
    match mode {
        BlendMode::Constant => Array3::ones(roi),
        BlendMode::Gaussian => {
            let [d, h, w] = roi.map(gaussian_1d);
            let mut weights = Array3::from_shape_fn(roi, |(z, y, x)| d[z] * h[y] * w[x]);

            let max = weights.fold(0f32, |m, &v| m.max(v));
            weights /= max;

            let floor = weights
                .iter()
                .copied()
                .filter(|&v| v > 0.)
                .fold(f32::INFINITY, f32::min);
            weights.mapv_inplace(|v| v.max(floor));
            weights
        }
    }
}

fn gaussian_1d(len: usize) -> Vec<f32> {
    let sigma = 0.125 * len as f32;
    let center = (len as f32 - 1.) / 2.;

    (0..len)
        .map(|i| {
            let x = i as f32 - center;
            (-(x * x) / (2. * sigma * sigma)).exp()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_peaks_at_the_centre_and_stays_positive() {
        let weights = blend_weights([9, 5, 64], BlendMode::Gaussian);

        assert!(weights.iter().all(|&w| w > 0.));
        let peak = weights.fold(0., |m: f32, &v| m.max(v));
        assert_eq!(weights[[4, 2, 31]].max(weights[[4, 2, 32]]), peak);
        assert!(weights[[0, 0, 0]] < weights[[4, 2, 31]]);
    }

    #[test]
    fn constant_is_all_ones() {
        let weights = blend_weights([2, 3, 4], BlendMode::Constant);
        assert!(weights.iter().all(|&w| w == 1.));
    }
}
