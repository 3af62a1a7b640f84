use serde::{Deserialize, Serialize};

use super::{ActFn, Model, Pointwise};
use crate::{MlErr, Result};

/// The supported network architectures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "name")]
pub enum ModelKind {
    /// A single per-voxel affine map from input channels to class logits.
    Linear,
    /// A per-voxel two layer network with a hidden activation.
    Pointwise { hidden: usize, act_fn: ActFn },
}

/// Everything that fixes a model's parameter layout and input shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub in_channels: usize,
    pub out_channels: usize,
    pub roi: [usize; 3],
}

impl ModelSpec {
    /// Checks the geometry and builds the model it describes.
    ///
    /// # Returns
    /// A boxed model or an error naming the offending value.
    pub fn build(&self) -> Result<Box<dyn Model>> {
        self.validate()?;
        Ok(Box::new(Pointwise::new(*self)))
    }

    /// The amount of voxels in one input patch.
    pub fn roi_volume(&self) -> usize {
        self.roi.iter().product()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |what, reason: &str| {
            Err(MlErr::InvalidArgument {
                what,
                reason: reason.to_string(),
            })
        };

        if self.in_channels == 0 {
            return invalid("in_channels", "must be at least 1");
        }

        if self.out_channels < 2 {
            return invalid("out_channels", "must be at least 2 (background and one class)");
        }

        if self.roi.contains(&0) {
            return invalid("roi", "every axis must be at least 1 voxel");
        }

        if let ModelKind::Pointwise { hidden: 0, .. } = self.kind {
            return invalid("hidden", "must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: ModelKind) -> ModelSpec {
        ModelSpec {
            kind,
            in_channels: 1,
            out_channels: 3,
            roi: [4, 4, 4],
        }
    }

    #[test]
    fn builds_every_kind() {
        let linear = spec(ModelKind::Linear).build().unwrap();
        assert_eq!(linear.size(), (1 + 1) * 3);

        let pointwise = spec(ModelKind::Pointwise {
            hidden: 5,
            act_fn: ActFn::Relu,
        })
        .build()
        .unwrap();
        assert_eq!(pointwise.size(), (1 + 1) * 5 + (5 + 1) * 3);
    }

    #[test]
    fn rejects_degenerate_geometry() {
        let mut bad = spec(ModelKind::Linear);
        bad.out_channels = 1;
        assert!(bad.build().is_err());

        let mut bad = spec(ModelKind::Linear);
        bad.roi = [4, 0, 4];
        assert!(bad.build().is_err());
    }
}
