mod activations;
mod init;
pub mod layers;
mod layout;
mod model;
mod pointwise;
mod spec;

pub use activations::ActFn;
pub use init::xavier_uniform;
pub use layout::{ParamEntry, ParamLayout};
pub use model::Model;
pub use pointwise::Pointwise;
pub use spec::{ModelKind, ModelSpec};
