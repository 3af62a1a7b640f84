use std::{env, ffi::OsString};

use futures::future;
use log::{error, info};
use tokio::process::Command;

use crate::{Result, WorkerErr};

/// Runs one worker process per local device and waits for all of them.
///
/// Each child is this same binary with this process's arguments plus `--local-rank`.
///
/// # Returns
/// An error naming the first child that failed, after every child exited.
pub async fn spawn_local_workers(nprocs: usize) -> Result<()> {
    let exe = env::current_exe()?;
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    let mut children = Vec::with_capacity(nprocs);
    for local_rank in 0..nprocs {
        let child = Command::new(&exe)
            .args(&args)
            .arg("--local-rank")
            .arg(local_rank.to_string())
            .kill_on_drop(true)
            .spawn()?;

        info!(local_rank = local_rank, pid = child.id().unwrap_or_default(); "spawned worker");
        children.push(child);
    }

    let waits = children.iter_mut().map(|child| child.wait());
    let statuses = future::join_all(waits).await;

    let mut failure = None;
    for (local_rank, status) in statuses.into_iter().enumerate() {
        let status = status?;
        if !status.success() {
            error!(local_rank = local_rank; "worker exited with {status}");
            failure.get_or_insert(WorkerErr::ChildFailed {
                local_rank,
                status: status.to_string(),
            });
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
