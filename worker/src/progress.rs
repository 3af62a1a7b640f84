/// How far a run got and the best validation accuracy it has seen.
///
/// `epoch` counts completed epochs, so it's also the next epoch to run. Neither it nor
/// `best_acc` ever go backwards.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainingProgress {
    pub epoch: usize,
    pub best_acc: f32,
    pub best_epoch: usize,
}

impl TrainingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the validation accuracy of `epoch`.
    ///
    /// # Returns
    /// Whether `acc` strictly improved on the best accuracy so far.
    pub fn record(&mut self, epoch: usize, acc: f32) -> bool {
        if acc > self.best_acc {
            self.best_acc = acc;
            self.best_epoch = epoch;
            true
        } else {
            false
        }
    }

    /// Marks `epoch` as completed.
    pub fn complete(&mut self, epoch: usize) {
        self.epoch = self.epoch.max(epoch + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_strict_improvements_count() {
        let mut progress = TrainingProgress {
            epoch: 7,
            best_acc: 0.83,
            best_epoch: 4,
        };

        assert!(!progress.record(7, 0.83));
        assert!(!progress.record(8, 0.5));
        assert_eq!((progress.best_acc, progress.best_epoch), (0.83, 4));

        assert!(progress.record(9, 0.9));
        assert_eq!((progress.best_acc, progress.best_epoch), (0.9, 9));
    }

    #[test]
    fn nan_never_improves() {
        let mut progress = TrainingProgress::new();
        assert!(!progress.record(0, f32::NAN));
    }

    #[test]
    fn epoch_counter_is_monotonic() {
        let mut progress = TrainingProgress::new();
        progress.complete(3);
        progress.complete(1);
        assert_eq!(progress.epoch, 4);
    }
}
