pub mod arch;
pub mod error;
pub mod inference;
pub mod loss;
pub mod metric;
pub mod optimization;
pub mod precision;
pub mod schedule;

pub use error::{MlErr, Result};
