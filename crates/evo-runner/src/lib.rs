//! Orchestration for batches of evolutionary robotics simulations: running
//! trials of the external simulation binary, aggregating tournaments from
//! finished trials, sweeping settings parameters, ranking results and fanning
//! runs out onto remote hosts.
//!
//! The shared data directory is the only state. An experiment directory that
//! exists has been run; a tournament older than its constituents is stale.

pub mod cancel;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod experiment;
pub mod ports;
pub mod process;
pub mod remote;
pub mod settings;
pub mod status;
pub mod store;
pub mod sweep;
pub mod tournament;

pub use cancel::CancelToken;
pub use cluster::{ClusterDistributor, ClusterReport, Host, HostOutcome, HostReport};
pub use config::{ExperimentConfig, ParsedConfig, Status};
pub use dispatch::{BatchObserver, BatchReport, Dispatcher, Job, JobOutcome, JobReport};
pub use error::{Result, RunnerError};
pub use experiment::{ExperimentRef, TournamentRef};
pub use ports::PortAllocator;
pub use process::{CommandRunner, Invocation, LocalRunner};
pub use remote::{RemoteSession, RemoteTransport, SshTransport};
pub use settings::{RunnerSettings, DEFAULT_SETTINGS_FILE};
pub use status::StatusRow;
pub use store::{ExperimentStore, FsStore};
pub use sweep::{ParameterSweep, SweepGrid, SweepPoint, SweepReport, SweepRequest};
pub use tournament::{TournamentAggregator, TournamentRequest};
