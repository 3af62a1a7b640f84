use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use machine_learning::{
    arch::{ActFn, ModelKind, ModelSpec},
    inference::BlendMode,
    optimization::{OptimizerKind, OptimizerSpec},
    precision::Precision,
    schedule::LrPolicy,
};

use crate::{
    Result,
    config::{
        AugmentConfig, Backend, CheckpointConfig, DataConfig, DistConfig, InferConfig,
        LossConfig, RunConfig,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelName {
    Pointwise,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Activation {
    Relu,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OptimName {
    Adam,
    Adamw,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScheduleKind {
    #[value(name = "warmup_cosine")]
    WarmupCosine,
    #[value(name = "cosine_anneal")]
    CosineAnneal,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Blend {
    Constant,
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendName {
    Tcp,
}

/// Volumetric segmentation training worker.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Resume training from this checkpoint.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Run directory name under ./runs.
    #[arg(long, default_value = "test")]
    pub logdir: String,

    /// Save checkpoints during training.
    #[arg(long)]
    pub save_checkpoint: bool,

    #[arg(long, default_value_t = 5000)]
    pub max_epochs: usize,

    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    /// Patches per model call during sliding-window inference.
    #[arg(long, default_value_t = 4)]
    pub sw_batch_size: usize,

    #[arg(long, default_value_t = 4e-4)]
    pub optim_lr: f32,

    #[arg(long, value_enum, default_value_t = OptimName::Adamw)]
    pub optim_name: OptimName,

    /// Weight decay.
    #[arg(long, default_value_t = 1e-5)]
    pub reg_weight: f32,

    #[arg(long, default_value_t = 0.99)]
    pub momentum: f32,

    /// Train in full precision.
    #[arg(long)]
    pub noamp: bool,

    /// Validate every this many epochs.
    #[arg(long, default_value_t = 100)]
    pub val_every: usize,

    /// Launch one worker per local device and train across nodes.
    #[arg(long)]
    pub distributed: bool,

    /// Number of nodes.
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    /// Rank of this node.
    #[arg(long, default_value_t = 0)]
    pub rank: usize,

    #[arg(long, default_value = "tcp://127.0.0.1:23456")]
    pub dist_url: String,

    #[arg(long, value_enum, default_value_t = BackendName::Tcp)]
    pub dist_backend: BackendName,

    /// Worker processes (devices) per node.
    #[arg(long, default_value_t = 1)]
    pub nprocs_per_node: usize,

    /// Set by the launcher on each spawned worker.
    #[arg(long, hide = true)]
    pub local_rank: Option<usize>,

    /// Seconds to wait for every rank to join.
    #[arg(long, default_value_t = 60)]
    pub rendezvous_timeout: u64,

    #[arg(long, value_enum, default_value_t = ModelName::Pointwise)]
    pub model_name: ModelName,

    #[arg(long, default_value_t = 16)]
    pub hidden_size: usize,

    #[arg(long, value_enum, default_value_t = Activation::Relu)]
    pub activation: Activation,

    /// Transformer geometry, accepted for compatibility. Pointwise models ignore it.
    #[arg(long)]
    pub num_heads: Option<usize>,

    #[arg(long)]
    pub feature_size: Option<usize>,

    #[arg(long)]
    pub mlp_dim: Option<usize>,

    #[arg(long)]
    pub dropout_rate: Option<f32>,

    #[arg(long, default_value_t = 1)]
    pub in_channels: usize,

    #[arg(long, default_value_t = 14)]
    pub out_channels: usize,

    #[arg(long, default_value_t = 96)]
    pub roi_x: usize,

    #[arg(long, default_value_t = 96)]
    pub roi_y: usize,

    #[arg(long, default_value_t = 96)]
    pub roi_z: usize,

    /// Probability of flipping each axis.
    #[arg(long, default_value_t = 0.2)]
    pub rand_flip_prob: f32,

    /// Probability of rotating a patch by quarter turns.
    #[arg(long, default_value_t = 0.2)]
    pub rand_rotate90_prob: f32,

    #[arg(long, default_value_t = 0.1)]
    pub rand_scale_intensity_prob: f32,

    #[arg(long, default_value_t = 0.1)]
    pub rand_shift_intensity_prob: f32,

    /// Overlap between neighbouring sliding-window patches.
    #[arg(long, default_value_t = 0.5)]
    pub infer_overlap: f32,

    #[arg(long, value_enum, default_value_t = Blend::Constant)]
    pub blend: Blend,

    #[arg(long, value_enum, default_value_t = ScheduleKind::WarmupCosine)]
    pub lrschedule: ScheduleKind,

    #[arg(long, default_value_t = 50)]
    pub warmup_epochs: usize,

    /// Initialize from pretrained weights.
    #[arg(long, requires = "pretrained_dir")]
    pub resume_ckpt: bool,

    /// Pretrained weights file.
    #[arg(long)]
    pub pretrained_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 1e-6)]
    pub smooth_dr: f32,

    #[arg(long, default_value_t = 0.0)]
    pub smooth_nr: f32,

    /// Seed of the parameter initialization and the sampler.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Synthetic training volumes.
    #[arg(long, default_value_t = 8)]
    pub train_volumes: usize,

    /// Synthetic validation volumes.
    #[arg(long, default_value_t = 2)]
    pub val_volumes: usize,

    /// Side of the cubic synthetic volumes.
    #[arg(long, default_value_t = 128)]
    pub volume_size: usize,
}

impl Cli {
    /// True for the launcher process that spawns one worker per local device.
    pub fn is_launcher(&self) -> bool {
        self.distributed && self.local_rank.is_none()
    }

    /// The geometry flags that were given but have no effect on the supported models.
    pub fn ignored_flags(&self) -> Vec<&'static str> {
        [
            ("--num-heads", self.num_heads.is_some()),
            ("--feature-size", self.feature_size.is_some()),
            ("--mlp-dim", self.mlp_dim.is_some()),
            ("--dropout-rate", self.dropout_rate.is_some()),
        ]
        .into_iter()
        .filter_map(|(flag, given)| given.then_some(flag))
        .collect()
    }

    /// Builds and validates the run configuration of this worker process.
    pub fn into_config(self) -> Result<RunConfig> {
        let (world_size, rank, local_rank) = if self.distributed {
            let local_rank = self.local_rank.unwrap_or(0);
            (
                self.world_size * self.nprocs_per_node,
                self.rank * self.nprocs_per_node + local_rank,
                local_rank,
            )
        } else {
            (1, 0, 0)
        };

        let act_fn = match self.activation {
            Activation::Relu => ActFn::Relu,
            Activation::Sigmoid => ActFn::sigmoid(1.0),
        };

        let kind = match self.model_name {
            ModelName::Pointwise => ModelKind::Pointwise {
                hidden: self.hidden_size,
                act_fn,
            },
            ModelName::Linear => ModelKind::Linear,
        };

        let optimizer_kind = match self.optim_name {
            OptimName::Adam => OptimizerKind::Adam,
            OptimName::Adamw => OptimizerKind::AdamW,
            OptimName::Sgd => OptimizerKind::Sgd,
        };

        let schedule = match self.lrschedule {
            ScheduleKind::WarmupCosine => LrPolicy::WarmupCosine {
                warmup_epochs: self.warmup_epochs,
            },
            ScheduleKind::CosineAnneal => LrPolicy::Cosine,
            ScheduleKind::None => LrPolicy::Constant,
        };

        let config = RunConfig {
            model: ModelSpec {
                kind,
                in_channels: self.in_channels,
                out_channels: self.out_channels,
                roi: [self.roi_x, self.roi_y, self.roi_z],
            },
            optimizer: OptimizerSpec {
                kind: optimizer_kind,
                learning_rate: self.optim_lr,
                weight_decay: self.reg_weight,
                momentum: self.momentum,
            },
            schedule,
            precision: if self.noamp {
                Precision::Full
            } else {
                Precision::Mixed
            },
            loss: LossConfig {
                smooth_nr: self.smooth_nr,
                smooth_dr: self.smooth_dr,
            },
            max_epochs: self.max_epochs,
            batch_size: self.batch_size,
            val_every: self.val_every,
            infer: InferConfig {
                overlap: self.infer_overlap,
                sw_batch_size: self.sw_batch_size,
                blend: match self.blend {
                    Blend::Constant => BlendMode::Constant,
                    Blend::Gaussian => BlendMode::Gaussian,
                },
            },
            augment: AugmentConfig {
                flip_prob: self.rand_flip_prob,
                rot90_prob: self.rand_rotate90_prob,
                scale_intensity_prob: self.rand_scale_intensity_prob,
                shift_intensity_prob: self.rand_shift_intensity_prob,
            },
            data: DataConfig {
                train_volumes: self.train_volumes,
                val_volumes: self.val_volumes,
                volume: [self.volume_size; 3],
                seed: self.seed,
            },
            dist: DistConfig {
                world_size,
                rank,
                local_rank,
                devices_per_node: self.nprocs_per_node,
                url: self.dist_url,
                backend: match self.dist_backend {
                    BackendName::Tcp => Backend::Tcp,
                },
                timeout_secs: self.rendezvous_timeout,
            },
            checkpoint: CheckpointConfig {
                run_dir: PathBuf::from("./runs").join(self.logdir),
                save: self.save_checkpoint,
                resume: self.checkpoint,
                pretrained: if self.resume_ckpt {
                    self.pretrained_dir
                } else {
                    None
                },
            },
            seed: self.seed,
        };

        config.validate()?;
        Ok(config)
    }
}
