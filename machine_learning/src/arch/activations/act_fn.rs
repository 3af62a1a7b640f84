use serde::{Deserialize, Serialize};

/// Element-wise activation applied after a dense layer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActFn {
    Relu,
    Sigmoid { amp: f32 },
}

use ActFn::*;

impl ActFn {
    pub fn sigmoid(amp: f32) -> Self {
        Sigmoid { amp }
    }

    pub fn f(&self, z: f32) -> f32 {
        match *self {
            Relu => z.max(0.),
            Sigmoid { amp } => amp / (1. + (-z).exp()),
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        match *self {
            Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Sigmoid { amp } => {
                let e = (-z).exp();
                (amp * e) / (e + 1.).powi(2)
            }
        }
    }
}
