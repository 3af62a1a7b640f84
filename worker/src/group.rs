use std::borrow::Cow;

use comms::{
    LinkReceiver, LinkSender,
    msg::{Command, Msg, Payload},
};
use futures::future;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{Result, WorkerErr};

type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Both halves of a connection between two ranks.
pub struct Link {
    pub(crate) rx: LinkReceiver<BoxedRead>,
    pub(crate) tx: LinkSender<BoxedWrite>,
}

impl Link {
    pub fn new<R, W>(rx: R, tx: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (rx, tx) = comms::channel(Box::new(rx) as BoxedRead, Box::new(tx) as BoxedWrite);
        Self { rx, tx }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        Self::new(rx, tx)
    }
}

enum Role {
    /// A single process, every collective is the identity.
    Solo,
    /// Rank 0, linked to every other rank. `peers[i]` is rank `i + 1`.
    Root { peers: Vec<Link> },
    Peer { root: Link },
}

/// Handle over the collective operations of a run.
///
/// Ranks are connected in a star around rank 0, which computes every reduction in rank
/// order and sends the result back, so every rank ends up with bit-identical values. Every
/// collective blocks until all ranks have reached it, so all of them must issue the same
/// collectives in the same order.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    role: Role,
    buf: Vec<u32>,
}

impl ProcessGroup {
    /// A group of one, which never performs I/O.
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            role: Role::Solo,
            buf: Vec::new(),
        }
    }

    /// Creates rank 0's handle from the links to every other rank, in rank order.
    pub fn root(peers: Vec<Link>) -> Self {
        Self {
            rank: 0,
            world_size: peers.len() + 1,
            role: Role::Root { peers },
            buf: Vec::new(),
        }
    }

    /// Creates the handle of a non-zero rank from its link to rank 0.
    pub fn peer(rank: usize, world_size: usize, root: Link) -> Self {
        Self {
            rank,
            world_size,
            role: Role::Peer { root },
            buf: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether this rank is the one that logs summaries and writes checkpoints.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// Replaces `values` with their element-wise sum over every rank.
    ///
    /// # Arguments
    /// * `values` - This rank's contribution, holds the reduced values on return.
    ///
    /// # Returns
    /// An error if a rank contributed a different amount of values or the group broke.
    pub async fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<()> {
        let Self { role, buf, .. } = self;

        match role {
            Role::Solo => Ok(()),
            Role::Root { peers } => {
                let mut failure = None;

                for (i, peer) in peers.iter_mut().enumerate() {
                    let rank = i + 1;
                    let err = match peer.rx.recv_into(buf).await? {
                        Msg::Data(Payload::Contribution(nums)) if nums.len() == values.len() => {
                            values.iter_mut().zip(nums).for_each(|(acc, x)| *acc += *x);
                            continue;
                        }
                        Msg::Data(Payload::Contribution(nums)) => WorkerErr::LengthMismatch {
                            rank,
                            got: nums.len(),
                            expected: values.len(),
                        },
                        Msg::Err(reason) => {
                            WorkerErr::Collective(format!("rank {rank} failed: {reason}"))
                        }
                        other => WorkerErr::UnexpectedMessage {
                            rank,
                            got: other.kind(),
                            expected: "data/contribution",
                        },
                    };

                    failure = Some(err);
                    break;
                }

                if let Some(failure) = failure {
                    abort(peers, &failure).await;
                    return Err(failure);
                }

                let msg = Msg::Data(Payload::Reduced(values));
                future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                Ok(())
            }
            Role::Peer { root } => {
                root.tx
                    .send(&Msg::Data(Payload::Contribution(values)))
                    .await?;
                recv_values(root, buf, values).await
            }
        }
    }

    /// Replaces `values` with their element-wise mean over every rank.
    pub async fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()> {
        self.all_reduce_sum(values).await?;

        if self.world_size > 1 {
            let n = self.world_size as f32;
            values.iter_mut().for_each(|v| *v /= n);
        }
        Ok(())
    }

    /// Overwrites `values` on every rank with rank 0's.
    pub async fn broadcast(&mut self, values: &mut [f32]) -> Result<()> {
        let Self { role, buf, .. } = self;

        match role {
            Role::Solo => Ok(()),
            Role::Root { peers } => {
                let msg = Msg::Data(Payload::Reduced(values));
                future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                Ok(())
            }
            Role::Peer { root } => recv_values(root, buf, values).await,
        }
    }

    /// Returns once every rank has called it.
    pub async fn barrier(&mut self) -> Result<()> {
        let Self { role, buf, .. } = self;

        match role {
            Role::Solo => Ok(()),
            Role::Root { peers } => {
                let mut failure = None;

                for (i, peer) in peers.iter_mut().enumerate() {
                    let err = match peer.rx.recv_into(buf).await? {
                        Msg::Control(Command::Barrier) => continue,
                        Msg::Err(reason) => {
                            WorkerErr::Collective(format!("rank {} failed: {reason}", i + 1))
                        }
                        other => WorkerErr::UnexpectedMessage {
                            rank: i + 1,
                            got: other.kind(),
                            expected: "barrier",
                        },
                    };

                    failure = Some(err);
                    break;
                }

                if let Some(failure) = failure {
                    abort(peers, &failure).await;
                    return Err(failure);
                }

                let msg = Msg::Control(Command::Barrier);
                future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                Ok(())
            }
            Role::Peer { root } => {
                root.tx.send(&Msg::Control(Command::Barrier)).await?;
                match root.rx.recv_into(buf).await? {
                    Msg::Control(Command::Barrier) => Ok(()),
                    other => Err(unexpected(other, "barrier")),
                }
            }
        }
    }

    /// Checks that every rank holds the same `values` for `what`.
    ///
    /// Meant to catch disagreements that would otherwise desynchronize the group, before
    /// the first collective that depends on them.
    ///
    /// # Returns
    /// An error on every rank if any rank disagrees with rank 0.
    pub async fn verify_uniform(&mut self, what: &str, values: &[u64]) -> Result<()> {
        let Self { role, buf, .. } = self;

        match role {
            Role::Solo => Ok(()),
            Role::Root { peers } => {
                let mut failure = None;

                for (i, peer) in peers.iter_mut().enumerate() {
                    let rank = i + 1;
                    let err = match peer.rx.recv_into(buf).await? {
                        Msg::Control(Command::Verify {
                            what: theirs,
                            values: got,
                        }) if theirs == what => {
                            if got == values {
                                continue;
                            }
                            WorkerErr::Divergence {
                                what: what.to_string(),
                                rank,
                                got,
                                expected: values.to_vec(),
                            }
                        }
                        Msg::Control(Command::Verify { what: theirs, .. }) => {
                            WorkerErr::Collective(format!(
                                "rank {rank} verified {theirs:?} while rank 0 verified {what:?}"
                            ))
                        }
                        Msg::Err(reason) => {
                            WorkerErr::Collective(format!("rank {rank} failed: {reason}"))
                        }
                        other => WorkerErr::UnexpectedMessage {
                            rank,
                            got: other.kind(),
                            expected: "verify",
                        },
                    };

                    // keep draining so every rank gets the verdict at the same point
                    failure.get_or_insert(err);
                }

                if let Some(failure) = failure {
                    abort(peers, &failure).await;
                    return Err(failure);
                }

                let msg = Msg::Control(Command::Verified);
                future::try_join_all(peers.iter_mut().map(|peer| peer.tx.send(&msg))).await?;
                Ok(())
            }
            Role::Peer { root } => {
                let msg = Msg::Control(Command::Verify {
                    what: what.to_string(),
                    values: values.to_vec(),
                });
                root.tx.send(&msg).await?;

                match root.rx.recv_into(buf).await? {
                    Msg::Control(Command::Verified) => Ok(()),
                    other => Err(unexpected(other, "verified")),
                }
            }
        }
    }

    /// Tells this rank's failure to the rest of the group, best effort.
    ///
    /// Ranks blocked in a collective with this one return an error instead of waiting
    /// forever.
    pub async fn abort(&mut self, reason: &WorkerErr) {
        match &mut self.role {
            Role::Solo => {}
            Role::Root { peers } => abort(peers, reason).await,
            Role::Peer { root } => {
                let msg = Msg::Err(Cow::Owned(reason.to_string()));
                if let Err(e) = root.tx.send(&msg).await {
                    debug!("could not report failure to rank 0: {e}");
                }
            }
        }
    }

    /// Leaves the group. Rank 0 waits for every other rank to leave first.
    pub async fn shutdown(self) -> Result<()> {
        let Self { role, mut buf, .. } = self;

        match role {
            Role::Solo => Ok(()),
            Role::Root { mut peers } => {
                for (i, peer) in peers.iter_mut().enumerate() {
                    match peer.rx.recv_into(&mut buf).await {
                        Ok(Msg::Control(Command::Disconnect)) => {}
                        Ok(other) => {
                            warn!(rank = i + 1; "expected disconnect, got {}", other.kind())
                        }
                        Err(e) => debug!(rank = i + 1; "link closed before disconnect: {e}"),
                    }
                }
                Ok(())
            }
            Role::Peer { mut root } => {
                root.tx.send(&Msg::Control(Command::Disconnect)).await?;
                Ok(())
            }
        }
    }
}

/// Receives rank 0's `Reduced` buffer into `values`.
async fn recv_values(root: &mut Link, buf: &mut Vec<u32>, values: &mut [f32]) -> Result<()> {
    match root.rx.recv_into(buf).await? {
        Msg::Data(Payload::Reduced(nums)) if nums.len() == values.len() => {
            values.copy_from_slice(nums);
            Ok(())
        }
        Msg::Data(Payload::Reduced(nums)) => Err(WorkerErr::LengthMismatch {
            rank: 0,
            got: nums.len(),
            expected: values.len(),
        }),
        other => Err(unexpected(other, "data/reduced")),
    }
}

/// Maps a message rank 0 wasn't supposed to send into an error.
fn unexpected(msg: Msg<'_>, expected: &'static str) -> WorkerErr {
    match msg {
        Msg::Err(reason) => WorkerErr::Collective(reason.into_owned()),
        other => WorkerErr::UnexpectedMessage {
            rank: 0,
            got: other.kind(),
            expected,
        },
    }
}

async fn abort(peers: &mut [Link], reason: &WorkerErr) {
    let msg = Msg::Err(Cow::Owned(reason.to_string()));

    for (i, peer) in peers.iter_mut().enumerate() {
        if let Err(e) = peer.tx.send(&msg).await {
            debug!(rank = i + 1; "could not report failure: {e}");
        }
    }
}
