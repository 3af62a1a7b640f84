use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::ParamLayout;
use crate::Result;

/// Generates a parameter buffer for `layout` using Xavier uniform initialization.
///
/// Every two dimensional entry is treated as a `[fan_in, fan_out]` weight matrix, every
/// other entry (biases) starts at zero.
///
/// # Arguments
/// * `layout` - The layout of the parameter buffer.
/// * `rng` - A random number generator, seed it for reproducible runs.
///
/// # Returns
/// The initialized parameters or an error if a distribution range is invalid.
pub fn xavier_uniform<R: Rng>(layout: &ParamLayout, rng: &mut R) -> Result<Vec<f32>> {
    let mut params = vec![0.; layout.size()];

    for entry in layout.entries() {
        let &[fan_in, fan_out] = entry.shape.as_slice() else {
            continue;
        };

        let range = (6. / (fan_in + fan_out) as f32).sqrt();
        let distribution = Uniform::new_inclusive(-range, range)?;

        params[entry.range.clone()]
            .iter_mut()
            .for_each(|p| *p = distribution.sample(rng));
    }

    Ok(params)
}
