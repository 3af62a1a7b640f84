use super::OptimizerKind;
use crate::{MlErr, Result};

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer: Send + Sync {
    /// The algorithm this optimizer implements.
    fn kind(&self) -> OptimizerKind;

    fn learning_rate(&self) -> f32;

    /// Sets the learning rate used by the following updates.
    fn set_learning_rate(&mut self, learning_rate: f32);

    /// Updates the provided slice of parameters using the given gradient.
    ///
    /// # Arguments
    /// * `grad` - A reference to the model's gradient.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    /// Exports the step counter and every per-parameter buffer.
    fn state(&self) -> OptimizerState;

    /// Restores a state previously produced by `state`.
    ///
    /// # Returns
    /// An error if the state was made by another algorithm or for another parameter count.
    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

/// A serializable snapshot of an optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: u64,
    pub buffers: Vec<(String, Vec<f32>)>,
}

impl OptimizerState {
    /// Moves the buffer called `name` out of the state, checking its length.
    pub(super) fn take(&mut self, name: &str, len: usize) -> Result<Box<[f32]>> {
        let pos = self
            .buffers
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| MlErr::OptimizerState(format!("missing buffer {name}")))?;

        let (_, buf) = self.buffers.swap_remove(pos);
        if buf.len() != len {
            return Err(MlErr::OptimizerState(format!(
                "buffer {name} holds {} values, expected {len}",
                buf.len()
            )));
        }

        Ok(buf.into_boxed_slice())
    }

    pub(super) fn check_kind(&self, expected: OptimizerKind) -> Result<()> {
        if self.kind != expected {
            return Err(MlErr::OptimizerState(format!(
                "state belongs to {:?}, this optimizer is {expected:?}",
                self.kind
            )));
        }

        Ok(())
    }
}

pub(super) fn check_sizes(grad: &[f32], params: &[f32], len: usize) -> Result<()> {
    for (what, got) in [("gradient", grad.len()), ("parameters", params.len())] {
        if got != len {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected: len,
            });
        }
    }

    Ok(())
}
