use serde::{Deserialize, Serialize};

use super::{Adam, Optimizer, Sgd};

/// The supported optimization algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with L2 weight decay folded into the gradient.
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
    /// Stochastic gradient descent with Nesterov momentum.
    Sgd,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
            OptimizerKind::Sgd => "sgd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "adam" => Some(OptimizerKind::Adam),
            "adamw" => Some(OptimizerKind::AdamW),
            "sgd" => Some(OptimizerKind::Sgd),
            _ => None,
        }
    }
}

/// The optimizer hyperparameters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: OptimizerKind,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub momentum: f32,
}

impl OptimizerSpec {
    /// Builds an optimizer holding state for `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer> {
        let Self {
            kind,
            learning_rate: lr,
            weight_decay: wd,
            momentum,
        } = *self;

        match kind {
            OptimizerKind::Adam => Box::new(Adam::new(len, lr, 0.9, 0.999, 1e-8, wd)),
            OptimizerKind::AdamW => Box::new(Adam::decoupled(len, lr, 0.9, 0.999, 1e-8, wd)),
            OptimizerKind::Sgd => Box::new(Sgd::new(len, lr, momentum, wd)),
        }
    }
}
