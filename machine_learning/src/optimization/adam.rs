use rayon::prelude::*;

use super::{
    Optimizer, OptimizerKind, OptimizerState,
    optimizer::check_sizes,
};
use crate::Result;

/// Adam, optionally with decoupled weight decay (AdamW).
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
    weight_decay: f32,
    decoupled: bool,
    step: u64,
}

impl Adam {
    /// Creates a new `Adam` optimizer, weight decay is applied as an L2 term on the gradient.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    /// * `weight_decay` - The L2 penalty coefficient.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(
        len: usize,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
            weight_decay,
            decoupled: false,
            step: 0,
        }
    }

    /// Creates a new AdamW optimizer, weight decay shrinks the parameters directly.
    pub fn decoupled(
        len: usize,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
    ) -> Self {
        Self {
            decoupled: true,
            ..Self::new(len, learning_rate, beta1, beta2, epsilon, weight_decay)
        }
    }
}

impl Optimizer for Adam {
    fn kind(&self) -> OptimizerKind {
        if self.decoupled {
            OptimizerKind::AdamW
        } else {
            OptimizerKind::Adam
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(grad, params, self.v.len())?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            decoupled,
            ..
        } = *self;

        self.step += 1;
        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);
        let shrink = 1. - lr * wd;

        params
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(self.v.par_iter_mut())
            .zip(self.s.par_iter_mut())
            .for_each(|(((p, &g), v), s)| {
                let g = if decoupled {
                    *p *= shrink;
                    g
                } else {
                    g + wd * *p
                };

                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind(),
            step: self.step,
            buffers: vec![
                ("exp_avg".to_string(), self.v.to_vec()),
                ("exp_avg_sq".to_string(), self.s.to_vec()),
            ],
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        state.check_kind(self.kind())?;

        let len = self.v.len();
        let v = state.take("exp_avg", len)?;
        let s = state.take("exp_avg_sq", len)?;

        self.v = v;
        self.s = s;
        self.step = state.step;
        self.beta1_t = self.beta1.powf(state.step as f32);
        self.beta2_t = self.beta2.powf(state.step as f32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_each_parameter_by_the_learning_rate() {
        let mut adam = Adam::new(3, 0.1, 0.9, 0.999, 1e-8, 0.);
        let mut params = [1., 1., 1.];
        adam.update_params(&[0.5, -2., 0.], &mut params).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-4);
        assert!((params[1] - 1.1).abs() < 1e-4);
        assert_eq!(params[2], 1.);
    }

    #[test]
    fn decoupled_decay_shrinks_without_gradient() {
        let mut adamw = Adam::decoupled(1, 0.1, 0.9, 0.999, 1e-8, 0.5);
        let mut params = [2.];
        adamw.update_params(&[0.], &mut params).unwrap();
        assert!((params[0] - 2. * (1. - 0.05)).abs() < 1e-6);

        let mut adam = Adam::new(1, 0.1, 0.9, 0.999, 1e-8, 0.5);
        let mut params = [2.];
        adam.update_params(&[0.], &mut params).unwrap();
        assert!((params[0] - 1.9).abs() < 1e-4);
    }

    #[test]
    fn restored_state_continues_identically() {
        let grads = [[0.3, -0.1], [0.2, 0.4], [-0.5, 0.1]];

        let mut a = Adam::new(2, 0.01, 0.9, 0.999, 1e-8, 1e-5);
        let mut pa = [0.5, -0.5];
        a.update_params(&grads[0], &mut pa).unwrap();

        let mut b = Adam::new(2, 0.01, 0.9, 0.999, 1e-8, 1e-5);
        b.load_state(a.state()).unwrap();
        let mut pb = pa;

        for g in &grads[1..] {
            a.update_params(g, &mut pa).unwrap();
            b.update_params(g, &mut pb).unwrap();
        }

        assert_eq!(pa, pb);
    }

    #[test]
    fn rejects_foreign_state() {
        let adamw = Adam::decoupled(2, 0.01, 0.9, 0.999, 1e-8, 0.);
        let mut adam = Adam::new(2, 0.01, 0.9, 0.999, 1e-8, 0.);
        assert!(adam.load_state(adamw.state()).is_err());

        let mut small = Adam::new(1, 0.01, 0.9, 0.999, 1e-8, 0.);
        assert!(small.load_state(adam.state()).is_err());
    }

    #[test]
    fn mismatched_lengths_are_an_error() {
        let mut adam = Adam::new(2, 0.01, 0.9, 0.999, 1e-8, 0.);
        assert!(adam.update_params(&[0.], &mut [0., 0.]).is_err());
    }
}
