mod adam;
mod optimizer;
mod sgd;
mod spec;

pub use adam::Adam;
pub use optimizer::{Optimizer, OptimizerState};
pub use sgd::Sgd;
pub use spec::{OptimizerKind, OptimizerSpec};
