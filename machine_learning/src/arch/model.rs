use ndarray::{Array5, ArrayView5};

use super::{ModelSpec, ParamLayout};
use crate::{MlErr, Result};

/// A segmentation network over a flat parameter buffer owned by the caller.
///
/// Inputs are `[batch, channel, d, h, w]` volumes whose spatial shape must be exactly the
/// configured region of interest, outputs are per-class logits of the same spatial shape.
pub trait Model: Send + Sync {
    /// Returns the geometry this model was built with.
    fn spec(&self) -> &ModelSpec;

    /// Returns the names, shapes and offsets of every tensor in the parameter buffer.
    fn layout(&self) -> &ParamLayout;

    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize {
        self.layout().size()
    }

    /// Computes the logits for `x`, caching what `backward` needs.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - A batch of input patches.
    ///
    /// # Returns
    /// The per-class logits or an error if the input doesn't match the model geometry.
    fn forward(&mut self, params: &[f32], x: ArrayView5<f32>) -> Result<Array5<f32>>;

    /// Computes the gradient of the loss with respect to the parameters for the last forward.
    ///
    /// # Arguments
    /// * `params` - The same parameters used in the last forward pass.
    /// * `grad` - A buffer where the gradient is written, it's overwritten.
    /// * `d_out` - The loss derivative with respect to the logits.
    fn backward(&mut self, params: &[f32], grad: &mut [f32], d_out: ArrayView5<f32>)
    -> Result<()>;

    /// Computes the logits for `x` without tracking anything for a backward pass.
    fn infer(&self, params: &[f32], x: ArrayView5<f32>) -> Result<Array5<f32>>;
}

/// Checks that `shape` is a `[_, in_channels, roi...]` batch for the given spec.
pub(super) fn check_input(spec: &ModelSpec, shape: &[usize]) -> Result<()> {
    let &[_, c, d, h, w] = shape else {
        return Err(MlErr::SizeMismatch {
            what: "input rank",
            got: shape.len(),
            expected: 5,
        });
    };

    if c != spec.in_channels || [d, h, w] != spec.roi {
        let mut expected = vec![shape[0], spec.in_channels];
        expected.extend(spec.roi);

        return Err(MlErr::ShapeMismatch {
            what: "model input",
            got: shape.to_vec(),
            expected,
        });
    }

    Ok(())
}
