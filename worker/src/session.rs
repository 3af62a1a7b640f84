use futures::future;
use log::{info, warn};
use machine_learning::arch::xavier_uniform;
use rand::{SeedableRng, rngs::StdRng};
use tokio::signal;

use crate::{
    Result, WorkerErr,
    bootstrap::{self, Device},
    checkpoint,
    config::RunConfig,
    data::{Augmenter, DataLoader, DistributedSampler, PhantomGenerator},
    engine::StepEngine,
    epoch::{EpochOrchestrator, RunSummary},
    group::ProcessGroup,
};

/// Builds everything a rank needs to train on top of an initialized process group.
///
/// Every rank initializes the model from the run seed, loads the configured weights and
/// then takes rank 0's training state, so all replicas start identical.
///
/// # Arguments
/// * `config` - The run configuration.
/// * `group` - This rank's process group.
///
/// # Returns
/// An orchestrator ready to run the remaining epochs.
pub async fn prepare(config: &RunConfig, mut group: ProcessGroup) -> Result<EpochOrchestrator> {
    let rank = group.rank();
    let world_size = group.world_size();

    if group.is_primary() {
        info!("run configuration:\n{}", serde_json::to_string_pretty(config)?);
    }

    let model = config.model.build()?;
    let params = xavier_uniform(model.layout(), &mut StdRng::seed_from_u64(config.seed))?;
    if group.is_primary() {
        info!(params = params.len(); "total trainable parameters");
    }

    let mut engine = StepEngine::new(config, model, params)?;
    let mut progress = checkpoint::restore(config, &mut engine)?;
    engine.sync_replicas(&mut group, &mut progress).await?;

    let num_classes = config.num_classes();
    let in_channels = config.model.in_channels;
    let data = &config.data;

    let train_set = PhantomGenerator::new(data.volume, in_channels, num_classes, data.seed)
        .dataset(data.train_volumes)?;
    let val_seed = data.seed.wrapping_add(1);
    let val_set = PhantomGenerator::new(data.volume, in_channels, num_classes, val_seed)
        .dataset(data.val_volumes)?;

    let sampler = DistributedSampler::train(train_set.len(), rank, world_size, config.seed);
    let augmenter = Augmenter::new(
        config.augment,
        config.model.roi,
        config.seed.wrapping_add(rank as u64),
    );
    let train = DataLoader::new(train_set, sampler, config.batch_size, Some(augmenter));

    let val = DistributedSampler::validation(val_set.len(), rank, world_size)
        .indices(0)
        .into_iter()
        .filter_map(|idx| val_set.get(idx).cloned())
        .collect();

    info!(
        batches = train.num_batches();
        "rank {rank}/{world_size} ready, starting at epoch {}",
        progress.epoch
    );

    EpochOrchestrator::new(config.clone(), group, engine, progress, train, val)
}

/// Trains over an already formed process group until the run ends or `interrupt` fires.
///
/// Any failure, an interruption included, is reported to the rest of the group before
/// returning so no rank is left blocked in a collective.
///
/// # Arguments
/// * `config` - The run configuration.
/// * `group` - This rank's process group.
/// * `interrupt` - Resolves when the run must stop early.
pub async fn train<F>(config: &RunConfig, group: ProcessGroup, interrupt: F) -> Result<RunSummary>
where
    F: Future<Output = ()>,
{
    let mut orchestrator = prepare(config, group).await?;
    tokio::pin!(interrupt);

    let ret = tokio::select! {
        biased;
        _ = &mut interrupt => {
            warn!("interrupted, aborting the run");
            Err(WorkerErr::Interrupted)
        }
        ret = orchestrator.run() => ret,
    };

    let summary = match ret {
        Ok(summary) => summary,
        Err(e) => {
            orchestrator.abort(&e).await;
            return Err(e);
        }
    };
    orchestrator.shutdown().await?;

    info!(
        best_acc = summary.best_acc,
        best_epoch = summary.best_epoch;
        "training finished"
    );
    Ok(summary)
}

/// Resolves on SIGINT. Never resolves if the handler can't be installed.
async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("can't listen for interrupts: {e}");
        future::pending::<()>().await;
    }
}

/// Runs a whole training session for this process: device pinning, rendezvous, training
/// and teardown.
pub async fn run(config: &RunConfig) -> Result<RunSummary> {
    let device = Device::pin(config.dist.local_rank, config.dist.devices_per_node)?;
    info!(threads = device.threads; "using device {}", device.local_rank);

    let interrupt = ctrl_c();
    tokio::pin!(interrupt);

    let group = tokio::select! {
        group = bootstrap::init_process_group(&config.dist) => group?,
        _ = &mut interrupt => {
            warn!("interrupted during rendezvous");
            return Err(WorkerErr::Interrupted);
        }
    };

    train(config, group, interrupt).await
}
