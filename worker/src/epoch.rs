use std::time::Instant;

use log::{debug, info, warn};
use machine_learning::schedule::ScheduleController;

use crate::{
    Result, WorkerErr,
    checkpoint::{CheckpointManager, Snapshot},
    config::RunConfig,
    data::{DataLoader, Sample},
    engine::StepEngine,
    group::ProcessGroup,
    metrics::WorkerMetrics,
    progress::TrainingProgress,
    validator::{ValidationReport, Validator},
};

/// What a finished run achieved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub best_acc: f32,
    pub best_epoch: usize,
    /// The amount of epochs this process ran, resumed ones excluded.
    pub epochs_run: usize,
}

/// Drives the epochs of a run: train, sometimes validate, then checkpoint.
///
/// Every rank runs its own orchestrator over the same configuration, so all of them reach
/// the same collectives in the same order.
pub struct EpochOrchestrator {
    config: RunConfig,
    group: ProcessGroup,
    engine: StepEngine,
    validator: Validator,
    checkpoints: CheckpointManager,
    schedule: ScheduleController,
    progress: TrainingProgress,
    train: DataLoader,
    val: Vec<Sample>,
    metrics: WorkerMetrics,
}

impl EpochOrchestrator {
    /// Creates a new `EpochOrchestrator`.
    ///
    /// # Arguments
    /// * `config` - The run configuration.
    /// * `group` - This rank's process group.
    /// * `engine` - A step engine whose replicas are already in sync.
    /// * `progress` - Where to start from, zeroed for a fresh run.
    /// * `train` - This rank's training loader.
    /// * `val` - This rank's share of the validation volumes.
    pub fn new(
        config: RunConfig,
        group: ProcessGroup,
        engine: StepEngine,
        progress: TrainingProgress,
        train: DataLoader,
        val: Vec<Sample>,
    ) -> Result<Self> {
        let validator = Validator::new(&config)?;
        let checkpoints = CheckpointManager::new(&config.checkpoint);

        let mut schedule = ScheduleController::new(
            config.schedule,
            config.optimizer.learning_rate,
            config.max_epochs,
        )?;
        schedule.seek(progress.epoch);

        Ok(Self {
            config,
            group,
            engine,
            validator,
            checkpoints,
            schedule,
            progress,
            train,
            val,
            metrics: WorkerMetrics::default(),
        })
    }

    /// Runs every remaining epoch.
    ///
    /// # Returns
    /// The best accuracy seen, including the one carried over from a resumed run.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let start = self.progress.epoch;
        let max_epochs = self.config.max_epochs;

        if start >= max_epochs {
            info!(epoch = start; "all {max_epochs} epochs are already done");
        }

        for epoch in start..max_epochs {
            let lr = self.schedule.current();
            self.engine.set_learning_rate(lr);

            let loss = self.train_epoch(epoch).await?;
            if self.group.is_primary() {
                info!(
                    epoch = epoch,
                    loss = loss,
                    lr = lr;
                    "epoch {}/{max_epochs} trained",
                    epoch + 1
                );
            }

            let mut improved = false;
            if self.should_validate(epoch) {
                let report = self.validate(epoch).await?;
                improved = self.record(epoch, &report);
            }

            self.progress.complete(epoch);
            self.schedule.advance();
            self.save(improved).await?;
            self.metrics.bump_epoch();
        }

        if self.group.is_primary() {
            self.metrics.log_summary();
        }

        Ok(RunSummary {
            best_acc: self.progress.best_acc,
            best_epoch: self.progress.best_epoch,
            epochs_run: max_epochs.saturating_sub(start),
        })
    }

    fn should_validate(&self, epoch: usize) -> bool {
        (epoch + 1) % self.config.val_every == 0 || epoch + 1 == self.config.max_epochs
    }

    /// Runs one pass over this rank's training batches.
    ///
    /// # Returns
    /// The mean step loss over every rank.
    async fn train_epoch(&mut self, epoch: usize) -> Result<f32> {
        let start = Instant::now();
        let mut totals = [0f32; 2];

        for batch in self.train.batches(epoch) {
            let batch = batch?;
            let outcome = self.engine.step(&mut self.group, &batch, epoch).await?;

            totals[0] += outcome.loss;
            totals[1] += 1.;
            self.metrics.bump_step(outcome.skipped);
            self.metrics.add_samples(batch.len());
        }

        self.group.all_reduce_sum(&mut totals).await?;
        self.metrics.train_time += start.elapsed();

        Ok(if totals[1] > 0. {
            totals[0] / totals[1]
        } else {
            0.
        })
    }

    async fn validate(&mut self, epoch: usize) -> Result<ValidationReport> {
        let start = Instant::now();

        let report = self
            .validator
            .evaluate(
                self.engine.model(),
                self.engine.params(),
                &self.val,
                &mut self.group,
            )
            .await?;

        self.metrics.val_time += start.elapsed();
        debug!(epoch = epoch, samples = report.samples; "per class dice {:?}", report.per_class);
        Ok(report)
    }

    /// Folds a validation report into the progress.
    ///
    /// # Returns
    /// Whether the accuracy improved.
    fn record(&mut self, epoch: usize, report: &ValidationReport) -> bool {
        let Some(acc) = report.mean else {
            warn!(epoch = epoch; "no class could be scored, skipping the accuracy comparison");
            return false;
        };

        let improved = self.progress.record(epoch, acc);
        if self.group.is_primary() {
            info!(
                epoch = epoch,
                acc = acc,
                best_acc = self.progress.best_acc;
                "validation finished{}",
                if improved { ", new best" } else { "" }
            );
        }
        improved
    }

    async fn save(&mut self, improved: bool) -> Result<()> {
        let start = Instant::now();

        let snapshot = Snapshot {
            layout: self.engine.model().layout(),
            params: self.engine.params(),
            optimizer: Some(self.engine.optimizer()),
            scaler: self.engine.scaler(),
            progress: self.progress,
            config: &self.config,
        };
        self.checkpoints
            .save(&mut self.group, &snapshot, improved)
            .await?;

        self.metrics.checkpoint_time += start.elapsed();
        Ok(())
    }

    pub fn engine(&self) -> &StepEngine {
        &self.engine
    }

    pub fn progress(&self) -> TrainingProgress {
        self.progress
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Fails every other rank of the group with `reason`.
    pub async fn abort(&mut self, reason: &WorkerErr) {
        self.group.abort(reason).await;
    }

    /// Leaves the process group.
    pub async fn shutdown(self) -> Result<()> {
        self.group.shutdown().await
    }
}
