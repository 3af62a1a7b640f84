use std::ops::Range;

use ndarray::{Array2, Array5, ArrayView5};

use super::{ModelKind, ModelSpec, ParamLayout, layers::Dense, model::check_input};
use crate::{MlErr, Result, arch::Model};

/// A stack of dense layers applied independently to every voxel.
///
/// Each voxel's channel vector is one row, so a `[b, c, d, h, w]` batch becomes a
/// `[b * d * h * w, c]` matrix flowing through the layers.
#[derive(Clone, Debug)]
pub struct Pointwise {
    spec: ModelSpec,
    layout: ParamLayout,
    layers: Vec<Dense>,
    ranges: Vec<Range<usize>>,
    batch: Option<[usize; 4]>,
}

impl Pointwise {
    /// Creates a new `Pointwise` model for `spec`.
    ///
    /// Tensors are named `layers.{i}.weight` (`[in, out]`) and `layers.{i}.bias` (`[out]`).
    pub fn new(spec: ModelSpec) -> Self {
        let dims = match spec.kind {
            ModelKind::Linear => vec![(spec.in_channels, spec.out_channels, None)],
            ModelKind::Pointwise { hidden, act_fn } => vec![
                (spec.in_channels, hidden, Some(act_fn)),
                (hidden, spec.out_channels, None),
            ],
        };

        let mut layout = ParamLayout::new();
        let mut layers = Vec::with_capacity(dims.len());
        let mut ranges = Vec::with_capacity(dims.len());

        for (i, (fan_in, fan_out, act_fn)) in dims.into_iter().enumerate() {
            let w = layout.push(format!("layers.{i}.weight"), &[fan_in, fan_out]);
            let b = layout.push(format!("layers.{i}.bias"), &[fan_out]);

            ranges.push(w.start..b.end);
            layers.push(Dense::new((fan_in, fan_out), act_fn));
        }

        Self {
            spec,
            layout,
            layers,
            ranges,
            batch: None,
        }
    }

    fn check_params(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.layout.size() {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected: self.layout.size(),
            });
        }

        Ok(())
    }
}

impl Model for Pointwise {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn forward(&mut self, params: &[f32], x: ArrayView5<f32>) -> Result<Array5<f32>> {
        check_input(&self.spec, x.shape())?;
        self.check_params("model parameters", params.len())?;

        let (b, _, d, h, w) = x.dim();
        let mut rows = to_rows(x)?;

        for (layer, range) in self.layers.iter_mut().zip(&self.ranges) {
            rows = layer.forward(&params[range.clone()], rows.view())?;
        }

        self.batch = Some([b, d, h, w]);
        from_rows(rows, [b, d, h, w])
    }

    fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d_out: ArrayView5<f32>,
    ) -> Result<()> {
        self.check_params("model parameters", params.len())?;
        self.check_params("model gradient", grad.len())?;

        let Some([b, d, h, w]) = self.batch else {
            return Err(MlErr::InvalidArgument {
                what: "backward pass",
                reason: "called before any forward pass".to_string(),
            });
        };

        let expected = [b, self.spec.out_channels, d, h, w];
        if d_out.shape() != expected {
            return Err(MlErr::ShapeMismatch {
                what: "logits delta",
                got: d_out.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        let mut delta = to_rows(d_out)?;
        for (layer, range) in self.layers.iter_mut().zip(&self.ranges).rev() {
            delta = layer.backward(&params[range.clone()], &mut grad[range.clone()], delta)?;
        }

        Ok(())
    }

    fn infer(&self, params: &[f32], x: ArrayView5<f32>) -> Result<Array5<f32>> {
        check_input(&self.spec, x.shape())?;
        self.check_params("model parameters", params.len())?;

        let (b, _, d, h, w) = x.dim();
        let mut rows = to_rows(x)?;

        for (layer, range) in self.layers.iter().zip(&self.ranges) {
            rows = layer.infer(&params[range.clone()], rows.view())?;
        }

        from_rows(rows, [b, d, h, w])
    }
}

/// `[b, c, d, h, w]` into `[b * d * h * w, c]`.
fn to_rows(x: ArrayView5<f32>) -> Result<Array2<f32>> {
    let (b, c, d, h, w) = x.dim();
    let rows = x
        .permuted_axes([0, 2, 3, 4, 1])
        .as_standard_layout()
        .into_owned();

    Ok(rows.into_shape_with_order((b * d * h * w, c))?)
}

/// `[b * d * h * w, k]` back into `[b, k, d, h, w]`.
fn from_rows(rows: Array2<f32>, [b, d, h, w]: [usize; 4]) -> Result<Array5<f32>> {
    let k = rows.ncols();
    let volume = rows.into_shape_with_order((b, d, h, w, k))?;

    Ok(volume
        .permuted_axes([0, 4, 1, 2, 3])
        .as_standard_layout()
        .into_owned())
}
