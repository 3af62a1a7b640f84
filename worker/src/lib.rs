pub mod bootstrap;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod group;
pub mod launch;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod session;
pub mod validator;

pub use config::RunConfig;
pub use epoch::{EpochOrchestrator, RunSummary};
pub use error::{Result, WorkerErr};
