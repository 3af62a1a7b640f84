use std::{error::Error, fmt, io, time::Duration};

use machine_learning::MlErr;
use safetensors::SafeTensorError;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Ml(MlErr),
    Json(serde_json::Error),
    SafeTensors(SafeTensorError),
    /// A configuration value that can't be used to start a run.
    Config {
        field: &'static str,
        reason: String,
    },
    /// This process has no device to pin itself to.
    NoDevice {
        local_rank: usize,
        devices: usize,
    },
    Rendezvous(String),
    RendezvousTimeout {
        addr: String,
        after: Duration,
    },
    UnexpectedMessage {
        rank: usize,
        got: &'static str,
        expected: &'static str,
    },
    LengthMismatch {
        rank: usize,
        got: usize,
        expected: usize,
    },
    /// A rank reported a value that disagrees with rank 0's.
    Divergence {
        what: String,
        rank: usize,
        got: Vec<u64>,
        expected: Vec<u64>,
    },
    /// The group was torn down by another rank's failure.
    Collective(String),
    BatchShape {
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Checkpoint(String),
    ChildFailed {
        local_rank: usize,
        status: String,
    },
    /// The process was asked to stop before the run finished.
    Interrupted,
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Ml(e) => write!(f, "numeric error: {e}"),
            WorkerErr::Json(e) => write!(f, "json error: {e}"),
            WorkerErr::SafeTensors(e) => write!(f, "checkpoint format error: {e}"),
            WorkerErr::Config { field, reason } => {
                write!(f, "invalid configuration value {field}: {reason}")
            }
            WorkerErr::NoDevice {
                local_rank,
                devices,
            } => write!(
                f,
                "local rank {local_rank} has no device, this node only has {devices}"
            ),
            WorkerErr::Rendezvous(reason) => write!(f, "rendezvous failed: {reason}"),
            WorkerErr::RendezvousTimeout { addr, after } => write!(
                f,
                "rendezvous at {addr} did not complete within {}s",
                after.as_secs_f32()
            ),
            WorkerErr::UnexpectedMessage {
                rank,
                got,
                expected,
            } => write!(
                f,
                "unexpected message from rank {rank}: got {got}, expected {expected}"
            ),
            WorkerErr::LengthMismatch {
                rank,
                got,
                expected,
            } => write!(
                f,
                "rank {rank} contributed {got} values, expected {expected}"
            ),
            WorkerErr::Divergence {
                what,
                rank,
                got,
                expected,
            } => write!(
                f,
                "rank {rank} disagrees on {what}: got {got:?}, rank 0 has {expected:?}"
            ),
            WorkerErr::Collective(reason) => write!(f, "process group aborted: {reason}"),
            WorkerErr::BatchShape { got, expected } => {
                write!(f, "batch shape {got:?} does not match {expected:?}")
            }
            WorkerErr::Checkpoint(reason) => write!(f, "checkpoint error: {reason}"),
            WorkerErr::ChildFailed { local_rank, status } => {
                write!(f, "worker for local rank {local_rank} failed: {status}")
            }
            WorkerErr::Interrupted => write!(f, "run interrupted"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            WorkerErr::Json(e) => Some(e),
            WorkerErr::SafeTensors(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<serde_json::Error> for WorkerErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<SafeTensorError> for WorkerErr {
    fn from(value: SafeTensorError) -> Self {
        Self::SafeTensors(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
