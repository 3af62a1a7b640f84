use std::{path::PathBuf, time::Duration};

use machine_learning::{
    arch::{ActFn, ModelKind, ModelSpec},
    inference::BlendMode,
    optimization::{OptimizerKind, OptimizerSpec},
    precision::Precision,
    schedule::LrPolicy,
};
use serde::{Deserialize, Serialize};

use crate::{Result, WorkerErr};

/// Sections of a [`RunConfig`] that may legitimately change between a run and its resumption.
const VOLATILE: &[&str] = &["dist", "checkpoint"];

/// Dice smoothing constants shared by the loss and the validation metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub smooth_nr: f32,
    pub smooth_dr: f32,
}

/// Sliding-window validation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferConfig {
    pub overlap: f32,
    pub sw_batch_size: usize,
    pub blend: BlendMode,
}

/// Probabilities of the training augmentations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Applied independently to each spatial axis.
    pub flip_prob: f32,
    /// Chance of turning the patch a random number of quarter turns in the (h, w) plane.
    #[serde(default)]
    pub rot90_prob: f32,
    pub scale_intensity_prob: f32,
    pub shift_intensity_prob: f32,
}

/// Size of the synthetic datasets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_volumes: usize,
    pub val_volumes: usize,
    pub volume: [usize; 3],
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Star topology over TCP, reductions computed by rank 0.
    #[default]
    Tcp,
}

/// Where this process sits in the process group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistConfig {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: usize,
    pub devices_per_node: usize,
    pub url: String,
    pub backend: Backend,
    pub timeout_secs: u64,
}

impl DistConfig {
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parses the rendezvous url.
    ///
    /// # Returns
    /// The `host:port` part of a `tcp://host:port` url.
    pub fn rendezvous_addr(&self) -> Result<String> {
        let invalid = |reason: &str| WorkerErr::Config {
            field: "dist_url",
            reason: format!("{reason} in {:?}", self.url),
        };

        let rest = self
            .url
            .strip_prefix("tcp://")
            .ok_or_else(|| invalid("expected the tcp:// scheme"))?;

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(rest.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub run_dir: PathBuf,
    pub save: bool,
    /// Lenient resume of weights, progress and optimizer state.
    pub resume: Option<PathBuf>,
    /// Strict weight-only initialization.
    pub pretrained: Option<PathBuf>,
}

/// Everything that fixes a run, built once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelSpec,
    pub optimizer: OptimizerSpec,
    pub schedule: LrPolicy,
    pub precision: Precision,
    pub loss: LossConfig,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub val_every: usize,
    pub infer: InferConfig,
    pub augment: AugmentConfig,
    pub data: DataConfig,
    pub dist: DistConfig,
    pub checkpoint: CheckpointConfig,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec {
                kind: ModelKind::Pointwise {
                    hidden: 16,
                    act_fn: ActFn::Relu,
                },
                in_channels: 1,
                out_channels: 14,
                roi: [96, 96, 96],
            },
            optimizer: OptimizerSpec {
                kind: OptimizerKind::AdamW,
                learning_rate: 4e-4,
                weight_decay: 1e-5,
                momentum: 0.99,
            },
            schedule: LrPolicy::WarmupCosine { warmup_epochs: 50 },
            precision: Precision::Mixed,
            loss: LossConfig {
                smooth_nr: 0.0,
                smooth_dr: 1e-6,
            },
            max_epochs: 5000,
            batch_size: 4,
            val_every: 100,
            infer: InferConfig {
                overlap: 0.5,
                sw_batch_size: 4,
                blend: BlendMode::Constant,
            },
            augment: AugmentConfig {
                flip_prob: 0.2,
                rot90_prob: 0.2,
                scale_intensity_prob: 0.1,
                shift_intensity_prob: 0.1,
            },
            data: DataConfig {
                train_volumes: 8,
                val_volumes: 2,
                volume: [128, 128, 128],
                seed: 0,
            },
            dist: DistConfig {
                world_size: 1,
                rank: 0,
                local_rank: 0,
                devices_per_node: 1,
                url: "tcp://127.0.0.1:23456".to_string(),
                backend: Backend::Tcp,
                timeout_secs: 60,
            },
            checkpoint: CheckpointConfig {
                run_dir: PathBuf::from("./runs/test"),
                save: false,
                resume: None,
                pretrained: None,
            },
            seed: 0,
        }
    }
}

impl RunConfig {
    /// Rejects values that would fail later, possibly in the middle of a collective call.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: String| Err(WorkerErr::Config { field, reason });

        if self.max_epochs == 0 {
            return invalid("max_epochs", "must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be at least 1".into());
        }
        if self.val_every == 0 {
            return invalid("val_every", "must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.infer.overlap) {
            return invalid(
                "infer_overlap",
                format!("{} is outside [0, 1)", self.infer.overlap),
            );
        }
        if self.infer.sw_batch_size == 0 {
            return invalid("sw_batch_size", "must be at least 1".into());
        }
        if self.model.in_channels == 0 {
            return invalid("in_channels", "must be at least 1".into());
        }
        if self.model.out_channels < 2 {
            return invalid(
                "out_channels",
                format!("{} classes, need at least 2", self.model.out_channels),
            );
        }
        if self.model.out_channels > u8::MAX as usize + 1 {
            return invalid(
                "out_channels",
                format!("{} classes don't fit a u8 label", self.model.out_channels),
            );
        }
        if self.model.roi.contains(&0) {
            return invalid("roi", format!("{:?} has an empty axis", self.model.roi));
        }
        if let ModelKind::Pointwise { hidden: 0, .. } = self.model.kind {
            return invalid("hidden_size", "must be at least 1".into());
        }
        if self.data.volume.contains(&0) {
            return invalid("volume", format!("{:?} has an empty axis", self.data.volume));
        }
        if self.data.train_volumes == 0 {
            return invalid("train_volumes", "must be at least 1".into());
        }
        if !(self.loss.smooth_dr > 0.0) {
            return invalid(
                "smooth_dr",
                format!("{} must be positive", self.loss.smooth_dr),
            );
        }
        if !(self.loss.smooth_nr >= 0.0) {
            return invalid(
                "smooth_nr",
                format!("{} must not be negative", self.loss.smooth_nr),
            );
        }
        if !(self.optimizer.learning_rate.is_finite() && self.optimizer.learning_rate >= 0.0) {
            return invalid(
                "optim_lr",
                format!("{} is not a learning rate", self.optimizer.learning_rate),
            );
        }

        let probs = [
            ("rand_flip_prob", self.augment.flip_prob),
            ("rand_rotate90_prob", self.augment.rot90_prob),
            ("rand_scale_intensity_prob", self.augment.scale_intensity_prob),
            ("rand_shift_intensity_prob", self.augment.shift_intensity_prob),
        ];
        for (field, p) in probs {
            if !(0.0..=1.0).contains(&p) {
                return invalid(field, format!("{p} is not a probability"));
            }
        }

        let dist = &self.dist;
        if dist.world_size == 0 {
            return invalid("world_size", "must be at least 1".into());
        }
        if dist.rank >= dist.world_size {
            return invalid(
                "rank",
                format!("{} is out of range for {} ranks", dist.rank, dist.world_size),
            );
        }
        if dist.devices_per_node == 0 {
            return invalid("nprocs_per_node", "must be at least 1".into());
        }
        if dist.is_distributed() {
            dist.rendezvous_addr()?;
        }

        Ok(())
    }

    /// Compares this configuration against the one stored by a previous run.
    ///
    /// # Returns
    /// The sections that differ, or an error if the model geometry differs since the
    /// stored weights can't be used at all then.
    pub fn drift(&self, stored: &RunConfig) -> Result<Vec<String>> {
        if self.model != stored.model {
            return Err(WorkerErr::Config {
                field: "model",
                reason: format!(
                    "checkpoint was trained with {:?}, this run uses {:?}",
                    stored.model, self.model
                ),
            });
        }

        let (serde_json::Value::Object(now), serde_json::Value::Object(then)) =
            (serde_json::to_value(self)?, serde_json::to_value(stored)?)
        else {
            return Ok(Vec::new());
        };

        Ok(now
            .iter()
            .filter(|(key, _)| !VOLATILE.contains(&key.as_str()))
            .filter(|(key, value)| then.get(key.as_str()) != Some(value))
            .map(|(key, _)| key.clone())
            .collect())
    }

    pub fn num_classes(&self) -> usize {
        self.model.out_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = RunConfig::default();
        config.infer.overlap = 1.0;
        assert!(matches!(
            config.validate(),
            Err(WorkerErr::Config {
                field: "infer_overlap",
                ..
            })
        ));

        let mut config = RunConfig::default();
        config.dist.world_size = 2;
        config.dist.rank = 2;
        assert!(matches!(
            config.validate(),
            Err(WorkerErr::Config { field: "rank", .. })
        ));

        let mut config = RunConfig::default();
        config.model.out_channels = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rendezvous_url_needs_the_tcp_scheme() {
        let mut config = RunConfig::default();
        assert_eq!(config.dist.rendezvous_addr().unwrap(), "127.0.0.1:23456");

        config.dist.url = "env://127.0.0.1:23456".into();
        config.dist.world_size = 2;
        assert!(config.validate().is_err());

        config.dist.url = "tcp://127.0.0.1".into();
        assert!(config.dist.rendezvous_addr().is_err());
    }

    #[test]
    fn drift_ignores_placement_but_not_hyperparameters() {
        let stored = RunConfig::default();

        let mut now = stored.clone();
        now.dist.rank = 0;
        now.dist.world_size = 4;
        now.checkpoint.save = true;
        assert!(now.drift(&stored).unwrap().is_empty());

        now.optimizer.learning_rate = 1e-3;
        now.max_epochs = 10;
        let mut drift = now.drift(&stored).unwrap();
        drift.sort();
        assert_eq!(drift, ["max_epochs", "optimizer"]);

        now.model.roi = [64, 64, 64];
        assert!(now.drift(&stored).is_err());
    }
}
