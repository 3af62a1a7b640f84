mod dice_ce;

pub use dice_ce::DiceCe;

use ndarray::{Array5, ArrayView4, ArrayView5};

use crate::Result;

/// A segmentation loss over per-class logits and integer class labels.
pub trait LossFn: Send + Sync {
    /// Computes the loss value and its derivative with respect to `logits`.
    ///
    /// # Arguments
    /// * `logits` - The `[batch, class, d, h, w]` model output.
    /// * `labels` - The `[batch, d, h, w]` ground truth class ids.
    ///
    /// # Returns
    /// The scalar loss and a gradient with the same shape as `logits`.
    fn loss_and_grad(
        &self,
        logits: ArrayView5<f32>,
        labels: ArrayView4<u8>,
    ) -> Result<(f32, Array5<f32>)>;

    /// Computes only the loss value.
    fn loss(&self, logits: ArrayView5<f32>, labels: ArrayView4<u8>) -> Result<f32> {
        self.loss_and_grad(logits, labels).map(|(loss, _)| loss)
    }
}
