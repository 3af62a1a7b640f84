use std::time::Duration;

use log::info;

/// Counters and timings of one worker's run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerMetrics {
    pub train_time: Duration,
    pub val_time: Duration,
    pub checkpoint_time: Duration,

    pub epochs: u64,
    pub steps: u64,
    pub skipped_steps: u64,
    pub samples: u64,
}

impl WorkerMetrics {
    #[inline]
    pub fn bump_epoch(&mut self) {
        self.epochs += 1;
    }

    #[inline]
    pub fn bump_step(&mut self, skipped: bool) {
        self.steps += 1;
        if skipped {
            self.skipped_steps += 1;
        }
    }

    #[inline]
    pub fn add_samples(&mut self, n: usize) {
        self.samples += n as u64;
    }

    /// Logs a one line summary of the run.
    pub fn log_summary(&self) {
        info!(
            epochs = self.epochs,
            steps = self.steps,
            skipped_steps = self.skipped_steps,
            samples = self.samples;
            "training took {:.1?}, validation {:.1?}, checkpointing {:.1?}",
            self.train_time,
            self.val_time,
            self.checkpoint_time
        );
    }
}
