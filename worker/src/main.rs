use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use worker::{cli::Cli, launch, logging, session};

async fn launch_workers(nprocs: usize) -> anyhow::Result<()> {
    logging::init(None);
    info!(nprocs = nprocs; "launching one worker per device");
    launch::spawn_local_workers(nprocs)
        .await
        .context("worker launch failed")
}

async fn train(cli: Cli) -> anyhow::Result<()> {
    let ignored = cli.ignored_flags();
    let config = cli.into_config().context("invalid configuration")?;
    logging::init(Some(config.dist.rank));

    for flag in ignored {
        warn!("{flag} has no effect on pointwise models, ignoring it");
    }

    session::run(&config)
        .await
        .with_context(|| format!("rank {} failed", config.dist.rank))?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let ret = if cli.is_launcher() {
        launch_workers(cli.nprocs_per_node).await
    } else {
        train(cli).await
    };

    match ret {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
