use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// How the learning rate evolves over the epochs of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LrPolicy {
    /// Linear ramp from 0 during `warmup_epochs`, then cosine decay to 0.
    WarmupCosine { warmup_epochs: usize },
    /// Cosine decay to 0 over the whole run.
    Cosine,
    Constant,
}

/// Computes the learning rate for `epoch`.
///
/// # Arguments
/// * `policy` - The schedule policy.
/// * `base_lr` - The peak learning rate.
/// * `max_epochs` - The total epoch budget of the run.
/// * `epoch` - The epoch being queried.
///
/// # Returns
/// A learning rate in `[0, base_lr]`.
pub fn lr(policy: LrPolicy, base_lr: f32, max_epochs: usize, epoch: usize) -> f32 {
    let warmup = match policy {
        LrPolicy::Constant => return base_lr,
        LrPolicy::Cosine => 0,
        LrPolicy::WarmupCosine { warmup_epochs } => warmup_epochs,
    };

    let base = base_lr as f64;

    if epoch < warmup {
        return (base * epoch as f64 / warmup as f64) as f32;
    }

    if max_epochs <= warmup {
        return base_lr;
    }

    let progress = ((epoch - warmup) as f64 / (max_epochs - warmup) as f64).min(1.);
    (base * 0.5 * (1. + (PI * progress).cos())) as f32
}

/// Tracks the epoch pointer the learning rate is queried with.
#[derive(Debug, Clone)]
pub struct ScheduleController {
    policy: LrPolicy,
    base_lr: f32,
    max_epochs: usize,
    epoch: usize,
}

impl ScheduleController {
    /// Creates a new `ScheduleController` positioned at epoch 0.
    ///
    /// # Returns
    /// An error if `base_lr` is negative or not finite.
    pub fn new(policy: LrPolicy, base_lr: f32, max_epochs: usize) -> Result<Self> {
        if !base_lr.is_finite() || base_lr < 0. {
            return Err(MlErr::InvalidArgument {
                what: "learning rate",
                reason: format!("must be finite and non-negative, got {base_lr}"),
            });
        }

        Ok(Self {
            policy,
            base_lr,
            max_epochs,
            epoch: 0,
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// The learning rate for the current epoch.
    pub fn current(&self) -> f32 {
        lr(self.policy, self.base_lr, self.max_epochs, self.epoch)
    }

    pub fn advance(&mut self) {
        self.epoch += 1;
    }

    /// Repositions the pointer, used when resuming a run.
    pub fn seek(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: f32 = 4e-4;

    #[test]
    fn stays_within_bounds() {
        for policy in [
            LrPolicy::WarmupCosine { warmup_epochs: 5 },
            LrPolicy::WarmupCosine { warmup_epochs: 0 },
            LrPolicy::Cosine,
            LrPolicy::Constant,
        ] {
            for e in 0..40 {
                let lr = lr(policy, BASE, 30, e);
                assert!((0. ..=BASE).contains(&lr), "{policy:?} epoch {e}: {lr}");
            }
        }
    }

    #[test]
    fn warmup_is_linear_from_zero() {
        let policy = LrPolicy::WarmupCosine { warmup_epochs: 4 };
        assert_eq!(lr(policy, BASE, 20, 0), 0.);
        assert!((lr(policy, BASE, 20, 2) - BASE / 2.).abs() < 1e-9);
    }

    #[test]
    fn continuous_at_the_warmup_boundary() {
        let policy = LrPolicy::WarmupCosine { warmup_epochs: 10 };
        assert_eq!(lr(policy, BASE, 100, 10), BASE);

        // the last warmup step is exactly one increment below the peak
        let before = lr(policy, BASE, 100, 9);
        assert!((BASE - before - BASE / 10.).abs() < 1e-9);
        assert!(lr(policy, BASE, 100, 11) < BASE);
    }

    #[test]
    fn no_division_when_budget_equals_warmup() {
        let policy = LrPolicy::WarmupCosine { warmup_epochs: 8 };
        assert_eq!(lr(policy, BASE, 8, 8), BASE);
        assert_eq!(lr(policy, BASE, 8, 12), BASE);
    }

    #[test]
    fn cosine_reaches_half_at_the_midpoint() {
        assert!((lr(LrPolicy::Cosine, BASE, 10, 5) - BASE / 2.).abs() < 1e-9);
        assert!(lr(LrPolicy::Cosine, BASE, 10, 10) < 1e-9);
    }

    #[test]
    fn controller_follows_its_pointer() {
        let mut schedule = ScheduleController::new(LrPolicy::Cosine, BASE, 10).unwrap();
        assert_eq!(schedule.current(), BASE);

        schedule.advance();
        assert_eq!(schedule.epoch(), 1);
        assert_eq!(schedule.current(), lr(LrPolicy::Cosine, BASE, 10, 1));

        schedule.seek(5);
        assert_eq!(schedule.current(), lr(LrPolicy::Cosine, BASE, 10, 5));
        assert!(ScheduleController::new(LrPolicy::Cosine, -1., 10).is_err());
    }
}
