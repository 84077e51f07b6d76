//! procwatch: process-monitoring coordinator for sharded worker batches.

pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod duration;
pub mod registry;
pub mod runner;
pub mod server;
pub mod sharder;
pub mod time;

pub use bridge::protocol::{
    ErrorCode, ErrorReply, PipelineEntry, ProgramInfo, RequestKind, StatusQuery,
};
pub use client::{ClientError, MonitorClient};
pub use config::CoordinatorConfig;
pub use registry::{Registry, RegistryError, RequestState, StatusReport};
pub use runner::{CommandSpawner, RunnerConfig, RunnerError, WorkerReport, WorkerSpawner, run_batch};
pub use server::{Coordinator, shutdown_signal};
pub use time::{Clock, SystemClock, Timeval};
