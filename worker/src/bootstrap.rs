use std::{num::NonZeroUsize, thread, time::Duration};

use comms::{
    msg::{Command, Msg},
    specs::group::JoinSpec,
};
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Instant},
};

use crate::{
    Result, WorkerErr,
    config::DistConfig,
    group::{Link, ProcessGroup},
};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The compute resources this process is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub local_rank: usize,
    pub threads: usize,
}

impl Device {
    /// Pins this process to the device of `local_rank`.
    ///
    /// A device is an equal share of the node's cores, the global compute pool is sized to
    /// it.
    ///
    /// # Arguments
    /// * `local_rank` - The rank of this process within its node.
    /// * `devices` - The amount of devices (worker processes) on this node.
    ///
    /// # Returns
    /// An error if `local_rank` has no device.
    pub fn pin(local_rank: usize, devices: usize) -> Result<Self> {
        if local_rank >= devices {
            return Err(WorkerErr::NoDevice {
                local_rank,
                devices,
            });
        }

        let cores = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let threads = (cores / devices).max(1);

        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            Ok(()) => debug!(local_rank = local_rank, threads = threads; "pinned compute pool"),
            Err(e) => debug!(local_rank = local_rank; "compute pool already set up: {e}"),
        }

        Ok(Self {
            local_rank,
            threads,
        })
    }
}

/// Joins this process to its process group.
///
/// Rank 0 listens at the rendezvous address and every other rank connects to it. A world
/// of one skips the rendezvous entirely.
pub async fn init_process_group(dist: &DistConfig) -> Result<ProcessGroup> {
    if !dist.is_distributed() {
        return Ok(ProcessGroup::solo());
    }

    let addr = dist.rendezvous_addr()?;
    let timeout = dist.timeout();

    if dist.rank == 0 {
        let listener = TcpListener::bind(&addr).await?;
        info!(world_size = dist.world_size; "waiting for ranks at {addr}");
        host(listener, dist.world_size, timeout).await
    } else {
        join(&addr, dist.rank, dist.world_size, timeout).await
    }
}

/// Admits the other `world_size - 1` ranks of the group as rank 0.
///
/// Joins with a rank out of range, an already taken rank or another world size are
/// refused and the slot stays open.
///
/// # Returns
/// Rank 0's handle, or an error if the group isn't complete within `timeout`.
pub async fn host(
    listener: TcpListener,
    world_size: usize,
    timeout: Duration,
) -> Result<ProcessGroup> {
    let addr = listener
        .local_addr()
        .map_or_else(|_| "<unbound>".to_string(), |a| a.to_string());

    let admit = async {
        let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();
        let mut buf: Vec<u32> = Vec::new();

        while slots.iter().any(Option::is_none) {
            let (stream, from) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let mut link = Link::tcp(stream);

            let spec = match link.rx.recv_into(&mut buf).await {
                Ok(Msg::Control(Command::Join(spec))) => spec,
                Ok(other) => {
                    warn!("expected a join from {from}, got {}", other.kind());
                    continue;
                }
                Err(e) => {
                    warn!("dropping connection from {from}: {e}");
                    continue;
                }
            };

            let refusal = if spec.world_size != world_size {
                Some(format!(
                    "world size {} disagrees with rank 0's {world_size}",
                    spec.world_size
                ))
            } else if spec.rank == 0 || spec.rank >= world_size {
                Some(format!("rank {} is out of range", spec.rank))
            } else if slots[spec.rank - 1].is_some() {
                Some(format!("rank {} already joined", spec.rank))
            } else {
                None
            };

            if let Some(reason) = refusal {
                warn!(rank = spec.rank; "refusing join from {from}: {reason}");
                if let Err(e) = link.tx.send(&Msg::Err(reason.into())).await {
                    debug!("could not send refusal: {e}");
                }
                continue;
            }

            link.tx
                .send(&Msg::Control(Command::Welcome { world_size }))
                .await?;
            info!(rank = spec.rank; "rank joined from {from}");
            slots[spec.rank - 1] = Some(link);
        }

        Ok::<_, WorkerErr>(slots.into_iter().flatten().collect())
    };

    let peers = time::timeout(timeout, admit)
        .await
        .map_err(|_| WorkerErr::RendezvousTimeout {
            addr,
            after: timeout,
        })??;

    Ok(ProcessGroup::root(peers))
}

/// Joins rank 0's group as `rank`, retrying the connection until `timeout` runs out.
///
/// # Returns
/// This rank's handle, or an error if rank 0 refuses the join or can't be reached in time.
pub async fn join(
    addr: &str,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<ProcessGroup> {
    let deadline = Instant::now() + timeout;

    let connect = async {
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!(rank = rank; "rank 0 not reachable yet: {e}");
                    time::sleep(RETRY_INTERVAL).await;
                }
            }
        };
        stream.set_nodelay(true)?;
        let mut link = Link::tcp(stream);

        link.tx
            .send(&Msg::Control(Command::Join(JoinSpec { rank, world_size })))
            .await?;

        let mut buf: Vec<u32> = Vec::new();
        match link.rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Welcome { world_size: ws }) if ws == world_size => {}
            Msg::Control(Command::Welcome { world_size: ws }) => {
                return Err(WorkerErr::Rendezvous(format!(
                    "rank 0 runs a world of {ws}, this rank expected {world_size}"
                )));
            }
            Msg::Err(reason) => return Err(WorkerErr::Rendezvous(reason.into_owned())),
            other => {
                return Err(WorkerErr::UnexpectedMessage {
                    rank: 0,
                    got: other.kind(),
                    expected: "welcome",
                });
            }
        }

        Ok::<_, WorkerErr>(link)
    };

    let link = time::timeout_at(deadline, connect)
        .await
        .map_err(|_| WorkerErr::RendezvousTimeout {
            addr: addr.to_string(),
            after: timeout,
        })??;

    info!(rank = rank, world_size = world_size; "joined the process group");
    Ok(ProcessGroup::peer(rank, world_size, link))
}
