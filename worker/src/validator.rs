use log::debug;
use machine_learning::{
    arch::Model,
    inference::{SlidingWindow, argmax_classes},
    metric::{ClassScores, DiceMetric},
};
use ndarray::{Array3, ArrayView4};

use crate::{Result, config::RunConfig, data::Sample, group::ProcessGroup};

/// The validation accuracy of a whole validation set.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Mean Dice per class, `None` for classes that were never scored.
    pub per_class: Vec<Option<f32>>,
    /// Mean Dice over every scored class-sample pair.
    pub mean: Option<f32>,
    /// The amount of samples scored across every rank.
    pub samples: usize,
}

/// Scores full volumes with sliding-window inference.
#[derive(Debug, Clone)]
pub struct Validator {
    window: SlidingWindow,
    metric: DiceMetric,
    num_classes: usize,
}

impl Validator {
    pub fn new(config: &RunConfig) -> Result<Self> {
        let window = SlidingWindow::new(
            config.model.roi,
            config.infer.overlap,
            config.infer.sw_batch_size,
            config.infer.blend,
        )?;
        let metric = DiceMetric::new(
            config.num_classes(),
            config.loss.smooth_nr,
            config.loss.smooth_dr,
        );

        Ok(Self {
            window,
            metric,
            num_classes: config.num_classes(),
        })
    }

    /// Predicts the class of every voxel of a `[channel, d, h, w]` volume.
    pub fn segment(
        &self,
        model: &dyn Model,
        params: &[f32],
        image: ArrayView4<f32>,
    ) -> Result<Array3<u8>> {
        let scores = self.window.infer(image, |patches| model.infer(params, patches))?;
        Ok(argmax_classes(scores.view()))
    }

    /// Scores this rank's share of the validation set and reduces the scores over the group.
    ///
    /// Every rank must call this at the same point, even one without samples, since it ends
    /// with a collective.
    ///
    /// # Arguments
    /// * `model` - The model to validate.
    /// * `params` - Its parameters.
    /// * `samples` - This rank's validation samples.
    /// * `group` - The process group the scores are summed over.
    pub async fn evaluate(
        &self,
        model: &dyn Model,
        params: &[f32],
        samples: &[Sample],
        group: &mut ProcessGroup,
    ) -> Result<ValidationReport> {
        let mut local = ClassScores::new(self.num_classes);

        for (i, sample) in samples.iter().enumerate() {
            let pred = self.segment(model, params, sample.image.view())?;
            let scores = self.metric.score(pred.view(), sample.label.view())?;
            debug!(sample = i; "validated sample, mean dice {:?}", scores.mean());
            local.merge(&scores)?;
        }

        let mut flat = local.to_flat();
        flat.push(samples.len() as f32);
        group.all_reduce_sum(&mut flat).await?;

        let samples = flat.pop().unwrap_or_default() as usize;
        let total = ClassScores::from_flat(&flat)?;

        Ok(ValidationReport {
            per_class: total.per_class(),
            mean: total.mean(),
            samples,
        })
    }
}
