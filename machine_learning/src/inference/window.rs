use ndarray::{Array3, Array4, Array5, ArrayView4, ArrayView5, Axis, Zip, s};

use super::{BlendMode, PatchGrid, blend_weights};
use crate::{MlErr, Result};

/// Runs a fixed-size model over overlapping patches of a larger volume and stitches the
/// blended logits back together.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    roi: [usize; 3],
    overlap: f32,
    sw_batch_size: usize,
    weights: Array3<f32>,
}

impl SlidingWindow {
    /// Creates a new `SlidingWindow`.
    ///
    /// # Arguments
    /// * `roi` - The model's fixed spatial input shape.
    /// * `overlap` - The fraction of a patch shared with its neighbour, in `[0, 1)`.
    /// * `sw_batch_size` - How many patches go through the model per call.
    /// * `mode` - How patch logits are weighted when stitched.
    pub fn new(
        roi: [usize; 3],
        overlap: f32,
        sw_batch_size: usize,
        mode: BlendMode,
    ) -> Result<Self> {
        if sw_batch_size == 0 {
            return Err(MlErr::InvalidArgument {
                what: "sliding window batch size",
                reason: "must be at least 1".to_string(),
            });
        }

        // Validates roi and overlap once up front.
        PatchGrid::new(roi, roi, overlap)?;

        Ok(Self {
            roi,
            overlap,
            sw_batch_size,
            weights: blend_weights(roi, mode),
        })
    }

    /// Computes the per-class scores of a whole `[channel, d, h, w]` volume.
    ///
    /// Axes shorter than the roi are zero padded symmetrically and cropped back afterwards.
    ///
    /// # Arguments
    /// * `volume` - The input volume.
    /// * `predict` - Maps a `[n, channel, roi...]` batch of patches to `[n, class, roi...]` logits.
    ///
    /// # Returns
    /// The `[class, d, h, w]` blended logits.
    pub fn infer<F>(&self, volume: ArrayView4<f32>, mut predict: F) -> Result<Array4<f32>>
    where
        F: FnMut(ArrayView5<f32>) -> Result<Array5<f32>>,
    {
        let (c, d, h, w) = volume.dim();
        let [r0, r1, r2] = self.roi;
        let (padded, [b0, b1, b2]) = self.padding([d, h, w]);

        let mut input = Array4::<f32>::zeros((c, padded[0], padded[1], padded[2]));
        input
            .slice_mut(s![.., b0..b0 + d, b1..b1 + h, b2..b2 + w])
            .assign(&volume);

        let grid = PatchGrid::new(padded, self.roi, self.overlap)?;
        let origins: Vec<_> = grid.origins().collect();

        let mut acc: Option<Array4<f32>> = None;
        let mut weight_sum = Array3::<f32>::zeros(padded);

        for chunk in origins.chunks(self.sw_batch_size) {
            let mut batch = Array5::<f32>::zeros((chunk.len(), c, r0, r1, r2));
            for (j, &[z, y, x]) in chunk.iter().enumerate() {
                batch
                    .index_axis_mut(Axis(0), j)
                    .assign(&input.slice(s![.., z..z + r0, y..y + r1, x..x + r2]));
            }

            let out = predict(batch.view())?;
            let (n, k, od, oh, ow) = out.dim();
            if n != chunk.len() || [od, oh, ow] != self.roi {
                return Err(MlErr::ShapeMismatch {
                    what: "patch logits",
                    got: out.shape().to_vec(),
                    expected: vec![chunk.len(), k, r0, r1, r2],
                });
            }

            let acc =
                acc.get_or_insert_with(|| Array4::zeros((k, padded[0], padded[1], padded[2])));
            if acc.len_of(Axis(0)) != k {
                return Err(MlErr::SizeMismatch {
                    what: "patch classes",
                    got: k,
                    expected: acc.len_of(Axis(0)),
                });
            }

            for (j, &[z, y, x]) in chunk.iter().enumerate() {
                let weighted = &out.index_axis(Axis(0), j) * &self.weights;
                let mut region = acc.slice_mut(s![.., z..z + r0, y..y + r1, x..x + r2]);
                region += &weighted;

                let mut region = weight_sum.slice_mut(s![z..z + r0, y..y + r1, x..x + r2]);
                region += &self.weights;
            }
        }

        let mut acc = acc.ok_or_else(|| MlErr::InvalidArgument {
            what: "volume",
            reason: "produced no patches".to_string(),
        })?;

        check_positive(&weight_sum)?;
        acc /= &weight_sum;

        Ok(acc
            .slice(s![.., b0..b0 + d, b1..b1 + h, b2..b2 + w])
            .to_owned())
    }

    /// Computes the summed blend weight each voxel of a `volume` shaped input receives.
    ///
    /// # Returns
    /// The weights or an error if some voxel has no positive weight.
    pub fn coverage(&self, volume: [usize; 3]) -> Result<Array3<f32>> {
        let [r0, r1, r2] = self.roi;
        let (padded, [b0, b1, b2]) = self.padding(volume);

        let grid = PatchGrid::new(padded, self.roi, self.overlap)?;
        let mut weight_sum = Array3::<f32>::zeros(padded);

        for [z, y, x] in grid.origins() {
            let mut region = weight_sum.slice_mut(s![z..z + r0, y..y + r1, x..x + r2]);
            region += &self.weights;
        }

        check_positive(&weight_sum)?;

        let [d, h, w] = volume;
        Ok(weight_sum
            .slice(s![b0..b0 + d, b1..b1 + h, b2..b2 + w])
            .to_owned())
    }

    /// The padded shape and the leading pad of every axis.
    fn padding(&self, volume: [usize; 3]) -> ([usize; 3], [usize; 3]) {
        let padded = [0, 1, 2].map(|i| volume[i].max(self.roi[i]));
        let before = [0, 1, 2].map(|i| (padded[i] - volume[i]) / 2);
        (padded, before)
    }
}

fn check_positive(weight_sum: &Array3<f32>) -> Result<()> {
    match weight_sum.indexed_iter().find(|&(_, &w)| !(w > 0.)) {
        Some(((z, y, x), _)) => Err(MlErr::NonPositiveBlendWeight { voxel: [z, y, x] }),
        None => Ok(()),
    }
}

/// Picks the highest scoring class of every voxel, ties go to the lowest class.
///
/// # Arguments
/// * `scores` - The `[class, d, h, w]` stitched logits.
pub fn argmax_classes(scores: ArrayView4<f32>) -> Array3<u8> {
    let (_, d, h, w) = scores.dim();
    let mut classes = Array3::<u8>::zeros((d, h, w));

    Zip::from(&mut classes)
        .and(scores.lanes(Axis(0)))
        .for_each(|class, lane| {
            let mut best = 0;
            for (c, &v) in lane.iter().enumerate() {
                if v > lane[best] {
                    best = c;
                }
            }
            *class = best as u8;
        });

    classes
}
