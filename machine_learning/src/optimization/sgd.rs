use rayon::prelude::*;

use super::{Optimizer, OptimizerKind, OptimizerState, optimizer::check_sizes};
use crate::Result;

/// Stochastic gradient descent with Nesterov momentum and L2 weight decay.
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
    step: u64,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    /// * `weight_decay` - The L2 penalty coefficient.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: vec![0.; len].into_boxed_slice(),
            step: 0,
        }
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(grad, params, self.velocity.len())?;

        let lr = self.learning_rate;
        let mu = self.momentum;
        let wd = self.weight_decay;
        self.step += 1;

        params
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(self.velocity.par_iter_mut())
            .for_each(|((p, &g), v)| {
                let g = g + wd * *p;
                *v = (mu * *v) + g;
                *p -= lr * (g + mu * *v);
            });

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: OptimizerKind::Sgd,
            step: self.step,
            buffers: vec![("momentum_buffer".to_string(), self.velocity.to_vec())],
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        state.check_kind(OptimizerKind::Sgd)?;
        self.velocity = state.take("momentum_buffer", self.velocity.len())?;
        self.step = state.step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesterov_steps() {
        let mut sgd = Sgd::new(1, 0.1, 0.5, 0.);
        let mut params = [1.];

        // v = 1, p -= 0.1 * (1 + 0.5)
        sgd.update_params(&[1.], &mut params).unwrap();
        assert!((params[0] - 0.85).abs() < 1e-6);

        // v = 1.5, p -= 0.1 * (1 + 0.75)
        sgd.update_params(&[1.], &mut params).unwrap();
        assert!((params[0] - 0.675).abs() < 1e-6);
    }

    #[test]
    fn learning_rate_is_set_externally() {
        let mut sgd = Sgd::new(1, 0.1, 0., 0.);
        sgd.set_learning_rate(0.);

        let mut params = [1.];
        sgd.update_params(&[5.], &mut params).unwrap();
        assert_eq!(params[0], 1.);
    }
}
