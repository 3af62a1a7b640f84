use log::{debug, warn};
use machine_learning::{
    arch::Model,
    loss::{DiceCe, LossFn},
    optimization::Optimizer,
    precision::{GradScaler, round_to_half, to_half_precision},
};

use crate::{
    Result, WorkerErr, config::RunConfig, data::Batch, group::ProcessGroup,
    progress::TrainingProgress,
};

/// The result of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// This rank's loss on its batch, before any reduction.
    pub loss: f32,
    /// Whether the optimizer step was skipped on overflowing gradients.
    pub skipped: bool,
}

/// Runs training steps over a model replica.
///
/// Owns the parameters, their gradient, the optimizer and, in mixed precision, the loss
/// scaler. Gradients are averaged over the process group before every optimizer step so
/// every replica applies the same update.
pub struct StepEngine {
    model: Box<dyn Model>,
    params: Vec<f32>,
    grad: Vec<f32>,
    optimizer: Box<dyn Optimizer>,
    scaler: Option<GradScaler>,
    loss_fn: DiceCe,
    steps: u64,
}

impl StepEngine {
    /// Creates a new `StepEngine`.
    ///
    /// # Arguments
    /// * `config` - The run configuration.
    /// * `model` - The model the parameters belong to.
    /// * `params` - The initial parameters, rank 0's are broadcast by `sync_replicas`.
    ///
    /// # Returns
    /// An error if `params` doesn't fit the model or the loss constants are invalid.
    pub fn new(config: &RunConfig, model: Box<dyn Model>, params: Vec<f32>) -> Result<Self> {
        if params.len() != model.size() {
            return Err(WorkerErr::LengthMismatch {
                rank: 0,
                got: params.len(),
                expected: model.size(),
            });
        }

        let optimizer = config.optimizer.build(params.len());
        let loss_fn = DiceCe::new(config.loss.smooth_nr, config.loss.smooth_dr)?;
        let scaler = config.precision.is_mixed().then(GradScaler::default);

        Ok(Self {
            grad: vec![0.; params.len()],
            model,
            params,
            optimizer,
            scaler,
            loss_fn,
            steps: 0,
        })
    }

    /// Overwrites every replica's training state with rank 0's.
    ///
    /// Covers the parameters, the optimizer state, the loss scaler and `progress`, so ranks
    /// that restored different checkpoints still resume from the same epoch with the same
    /// state. Must run once after the parameters were initialized or loaded, before the
    /// first step.
    ///
    /// # Arguments
    /// * `group` - The process group to sync over.
    /// * `progress` - This rank's restored progress, holds rank 0's on return.
    ///
    /// # Returns
    /// An error on every rank if the replicas' state doesn't have the same layout.
    pub async fn sync_replicas(
        &mut self,
        group: &mut ProcessGroup,
        progress: &mut TrainingProgress,
    ) -> Result<()> {
        let mut state = self.optimizer.state();

        let mut layout = vec![
            self.params.len() as u64,
            self.scaler.is_some() as u64,
            state.buffers.len() as u64,
        ];
        layout.extend(state.buffers.iter().map(|(_, buf)| buf.len() as u64));
        group.verify_uniform("training state layout", &layout).await?;

        group.broadcast(&mut self.params).await?;
        for (_, buf) in &mut state.buffers {
            group.broadcast(buf).await?;
        }

        // integers travel as raw bits, broadcast copies them untouched
        let (scale, stable_steps) = self
            .scaler
            .as_ref()
            .map_or((0., 0), |s| (s.scale(), s.stable_steps()));
        let mut header = [
            f32::from_bits(progress.epoch as u32),
            progress.best_acc,
            f32::from_bits(progress.best_epoch as u32),
            f32::from_bits(state.step as u32),
            f32::from_bits((state.step >> 32) as u32),
            scale,
            f32::from_bits(stable_steps),
        ];
        group.broadcast(&mut header).await?;

        let synced = TrainingProgress {
            epoch: header[0].to_bits() as usize,
            best_acc: header[1],
            best_epoch: header[2].to_bits() as usize,
        };
        if synced != *progress {
            warn!(
                epoch = progress.epoch,
                best_acc = progress.best_acc;
                "restored progress differs from rank 0's, resuming from epoch {}",
                synced.epoch
            );
        }
        *progress = synced;

        state.step = u64::from(header[3].to_bits()) | (u64::from(header[4].to_bits()) << 32);
        self.optimizer.load_state(state)?;
        if let Some(scaler) = &mut self.scaler {
            scaler.restore(header[5], header[6].to_bits());
        }

        Ok(())
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Runs one synchronized training step on `batch`.
    ///
    /// Every rank must call this the same amount of times per epoch with batches of the
    /// same shape. The shape is checked against the model and against every other rank
    /// before any gradient is exchanged.
    ///
    /// # Arguments
    /// * `group` - The process group gradients are averaged over.
    /// * `batch` - This rank's batch.
    /// * `epoch` - The epoch the step belongs to.
    pub async fn step(
        &mut self,
        group: &mut ProcessGroup,
        batch: &Batch,
        epoch: usize,
    ) -> Result<StepOutcome> {
        self.check_batch(batch)?;

        let shape: Vec<u64> = batch.images.shape().iter().map(|&n| n as u64).collect();
        group.verify_uniform("batch shape", &shape).await?;

        self.grad.fill(0.);

        let loss = match &self.scaler {
            Some(scaler) => {
                let mut params = self.params.clone();
                round_to_half(&mut params);
                let x = batch.images.mapv(to_half_precision);

                let logits = self.model.forward(&params, x.view())?;
                let (loss, d_logits) = self
                    .loss_fn
                    .loss_and_grad(logits.view(), batch.labels.view())?;

                let scale = scaler.scale();
                let d_logits = d_logits.mapv(|g| to_half_precision(g * scale));
                self.model.backward(&params, &mut self.grad, d_logits.view())?;
                round_to_half(&mut self.grad);
                loss
            }
            None => {
                let logits = self.model.forward(&self.params, batch.images.view())?;
                let (loss, d_logits) = self
                    .loss_fn
                    .loss_and_grad(logits.view(), batch.labels.view())?;
                self.model.backward(&self.params, &mut self.grad, d_logits.view())?;
                loss
            }
        };

        group.all_reduce_mean(&mut self.grad).await?;

        let skipped = match &mut self.scaler {
            Some(scaler) => {
                let found_inf = scaler.unscale(&mut self.grad);
                scaler.update(found_inf);
                if found_inf {
                    warn!(
                        epoch = epoch,
                        step = self.steps,
                        scale = scaler.scale();
                        "non-finite gradients, skipping step"
                    );
                }
                found_inf
            }
            None => false,
        };

        if !skipped {
            self.optimizer.update_params(&self.grad, &mut self.params)?;
        }

        debug!(epoch = epoch, step = self.steps, loss = loss; "step done");
        self.steps += 1;

        Ok(StepOutcome { loss, skipped })
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        let spec = self.model.spec();
        let [d, h, w] = spec.roi;
        let b = batch.len().max(1);

        let expected = [b, spec.in_channels, d, h, w];
        if batch.images.shape() != expected {
            return Err(WorkerErr::BatchShape {
                got: batch.images.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        let expected = [b, d, h, w];
        if batch.labels.shape() != expected {
            return Err(WorkerErr::BatchShape {
                got: batch.labels.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        Ok(())
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Mutable access to the parameters, for loading weights before `sync_replicas`.
    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn optimizer_mut(&mut self) -> &mut dyn Optimizer {
        self.optimizer.as_mut()
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    pub fn scaler_mut(&mut self) -> Option<&mut GradScaler> {
        self.scaler.as_mut()
    }

    /// The amount of steps run, skipped ones included.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}
