use crate::{MlErr, Result};

/// Computes the patch origins along one axis.
///
/// Origins step by `max(1, floor(roi * (1 - overlap)))` and the last one is clamped to
/// `size - roi`, so the far edge is always covered without stepping past it.
///
/// # Arguments
/// * `size` - The axis length, at least `roi`.
/// * `roi` - The patch length.
/// * `overlap` - The fraction of a patch shared with its neighbour, in `[0, 1)`.
pub fn axis_origins(size: usize, roi: usize, overlap: f32) -> Vec<usize> {
    if size <= roi {
        return vec![0];
    }

    let interval = ((roi as f32 * (1. - overlap)).floor() as usize).max(1);
    let span = size - roi;
    let n = span.div_ceil(interval) + 1;

    (0..n).map(|i| (i * interval).min(span)).collect()
}

/// The ordered patch origins covering a whole volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGrid {
    roi: [usize; 3],
    axes: [Vec<usize>; 3],
}

impl PatchGrid {
    /// Creates a new `PatchGrid`.
    ///
    /// # Arguments
    /// * `volume` - The spatial shape to cover, every axis at least as long as the roi.
    /// * `roi` - The patch shape.
    /// * `overlap` - The overlap fraction in `[0, 1)`.
    pub fn new(volume: [usize; 3], roi: [usize; 3], overlap: f32) -> Result<Self> {
        if !(0. ..1.).contains(&overlap) {
            return Err(MlErr::InvalidArgument {
                what: "overlap",
                reason: format!("must be in [0, 1), got {overlap}"),
            });
        }

        if volume.iter().zip(&roi).any(|(v, r)| v < r) || roi.contains(&0) {
            return Err(MlErr::ShapeMismatch {
                what: "patch grid volume",
                got: volume.to_vec(),
                expected: roi.to_vec(),
            });
        }

        let axes = [0, 1, 2].map(|i| axis_origins(volume[i], roi[i], overlap));
        Ok(Self { roi, axes })
    }

    pub fn roi(&self) -> [usize; 3] {
        self.roi
    }

    pub fn len(&self) -> usize {
        self.axes.iter().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the origins in `d`, `h`, `w` order.
    pub fn origins(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let [d, h, w] = &self.axes;
        d.iter()
            .flat_map(move |&z| h.iter().flat_map(move |&y| w.iter().map(move |&x| [z, y, x])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_clamp_to_the_far_edge() {
        assert_eq!(axis_origins(10, 4, 0.5), [0, 2, 4, 6]);
        assert_eq!(axis_origins(9, 4, 0.5), [0, 2, 4, 5]);
        assert_eq!(axis_origins(8, 4, 0.), [0, 4]);
        assert_eq!(axis_origins(4, 4, 0.5), [0]);
        assert_eq!(axis_origins(5, 1, 0.9), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn grid_covers_every_voxel() {
        let volume = [7, 9, 5];
        let roi = [3, 4, 5];
        let grid = PatchGrid::new(volume, roi, 0.25).unwrap();

        let mut covered = vec![false; volume.iter().product()];
        for [z, y, x] in grid.origins() {
            for dz in 0..roi[0] {
                for dy in 0..roi[1] {
                    for dx in 0..roi[2] {
                        let idx = ((z + dz) * volume[1] + y + dy) * volume[2] + x + dx;
                        covered[idx] = true;
                    }
                }
            }
        }

        assert!(covered.iter().all(|&c| c));
        assert_eq!(grid.origins().count(), grid.len());
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        assert!(PatchGrid::new([8, 8, 8], [4, 4, 4], 1.).is_err());
        assert!(PatchGrid::new([8, 8, 8], [4, 4, 4], -0.1).is_err());
        assert!(PatchGrid::new([3, 8, 8], [4, 4, 4], 0.5).is_err());
    }
}
