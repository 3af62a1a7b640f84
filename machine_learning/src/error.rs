use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;
use rand_distr::uniform::Error as UniformError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    LabelOutOfRange {
        label: u8,
        num_classes: usize,
    },
    NonPositiveBlendWeight {
        voxel: [usize; 3],
    },
    InvalidArgument {
        what: &'static str,
        reason: String,
    },
    OptimizerState(String),
    Shape(ShapeError),
    Distribution(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            MlErr::LabelOutOfRange { label, num_classes } => write!(
                f,
                "Found label {label} but the model only predicts {num_classes} classes"
            ),
            MlErr::NonPositiveBlendWeight { voxel } => write!(
                f,
                "Voxel {voxel:?} was left without a positive blend weight after stitching"
            ),
            MlErr::InvalidArgument { what, reason } => write!(f, "Invalid {what}: {reason}"),
            MlErr::OptimizerState(reason) => {
                write!(f, "Failed to restore the optimizer state: {reason}")
            }
            MlErr::Shape(e) => write!(f, "Failed to view buffer with the given shape: {e}"),
            MlErr::Distribution(e) => write!(f, "Invalid weight distribution: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<UniformError> for MlErr {
    fn from(value: UniformError) -> Self {
        Self::Distribution(value.to_string())
    }
}
