//! Batch runner - shards files across worker processes and reports each one
//! to the coordinator.
//!
//! Flow per worker:
//! 1. Spawn the worker with its share of files, output captured to a file
//! 2. Register it (NEW) on the well-known channel
//! 3. Connect the worker channel the coordinator opened for its pid
//! 4. Wait for exit; UPDATE on success, ERROR otherwise
//! 5. Scrape the reported duration from the captured output

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::process::{Child, Command};

use crate::bridge::protocol::{MAX_NAME_LEN, ProgramInfo, truncate_at_boundary};
use crate::bridge::transport::WELL_KNOWN_CHANNEL;
use crate::client::{ClientError, MonitorClient};
use crate::config::default_runtime_dir;
use crate::duration::retrieve_time_from_file;
use crate::registry::StatusReport;
use crate::sharder::{DEFAULT_MAX_FILES_PER_FORK, divide_files_per_fork, shard};

/// What one worker is asked to do.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSpec<'a> {
    pub index: usize,
    pub files: &'a [PathBuf],
    /// File receiving the worker's stdout and stderr.
    pub capture: &'a Path,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &WorkerSpec<'_>) -> Result<Child, SpawnError>;

    /// Name the worker is registered under, at most [`MAX_NAME_LEN`] bytes.
    fn describe(&self, spec: &WorkerSpec<'_>) -> String;
}

/// Runs `program args... files...` with output redirected to the capture file.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Build from a command line such as `["cargo", "test", "--"]`.
    pub fn from_command_line(command: &[String]) -> Result<Self, SpawnError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SpawnError::Other("empty command".to_string()))?;
        Ok(Self::new(program.clone()).with_args(args.iter().cloned()))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, spec: &WorkerSpec<'_>) -> Result<Child, SpawnError> {
        let stdout = std::fs::File::create(spec.capture)?;
        let stderr = stdout.try_clone()?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .args(spec.files)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    /// The full command line with the worker's files. When that does not
    /// fit, the arguments are dropped so the files stay visible.
    fn describe(&self, spec: &WorkerSpec<'_>) -> String {
        let files = spec
            .files
            .iter()
            .map(|file| file.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let command = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain((!files.is_empty()).then_some(files.as_str()))
            .collect::<Vec<_>>()
            .join(" ");

        let mut name = if command.len() <= MAX_NAME_LEN || files.is_empty() {
            command
        } else {
            format!("{} {files}", self.program)
        };
        truncate_at_boundary(&mut name, MAX_NAME_LEN);
        name
    }
}

pub struct RunnerConfig {
    pub runtime_dir: PathBuf,
    pub channel_name: String,
    /// Where captured worker output goes. Defaults to `{runtime_dir}/captures`.
    pub capture_dir: Option<PathBuf>,
    pub max_files_per_fork: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl RunnerConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            channel_name: WELL_KNOWN_CHANNEL.to_string(),
            capture_dir: None,
            max_files_per_fork: DEFAULT_MAX_FILES_PER_FORK,
            spawner,
        }
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn with_capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn with_max_files_per_fork(mut self, max: usize) -> Self {
        self.max_files_per_fork = max;
        self
    }

    pub fn channel_path(&self) -> PathBuf {
        self.runtime_dir.join(&self.channel_name)
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.capture_dir
            .clone()
            .unwrap_or_else(|| self.runtime_dir.join("captures"))
    }
}

/// Outcome of one worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub pid: i32,
    pub files: Vec<PathBuf>,
    pub exit_code: Option<i32>,
    /// Duration the worker reported about itself; `None` if it did not.
    pub duration_ms: Option<u64>,
    /// Coordinator's view of the worker after it finished.
    pub status: StatusReport,
}

impl WorkerReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("worker has no pid (exited before it could be tracked)")]
    MissingPid,

    #[error("failed to wait for worker {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("capture file {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Run `files` through workers sharded by `config.max_files_per_fork`.
///
/// Workers run concurrently; the first error aborts the batch (remaining
/// children are killed on drop).
pub async fn run_batch(config: &RunnerConfig, files: &[PathBuf]) -> Result<Vec<WorkerReport>, RunnerError> {
    let plan = divide_files_per_fork(files.len(), config.max_files_per_fork);
    tracing::info!(
        files = files.len(),
        forks = plan.num_forks,
        files_per_fork = plan.files_per_fork,
        "Sharding batch"
    );

    let capture_dir = config.capture_dir();
    tokio::fs::create_dir_all(&capture_dir)
        .await
        .map_err(|source| RunnerError::Capture {
            path: capture_dir.clone(),
            source,
        })?;

    let workers = shard(files, config.max_files_per_fork)
        .into_iter()
        .enumerate()
        .map(|(index, batch)| {
            let capture = capture_dir.join(format!("worker-{index}.log"));
            async move { run_worker(config, index, batch, capture).await }
        });

    futures::future::try_join_all(workers).await
}

async fn run_worker(
    config: &RunnerConfig,
    index: usize,
    files: &[PathBuf],
    capture: PathBuf,
) -> Result<WorkerReport, RunnerError> {
    let spec = WorkerSpec {
        index,
        files,
        capture: &capture,
    };
    let mut child = config.spawner.spawn(&spec)?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .ok_or(RunnerError::MissingPid)?;
    tracing::info!(target: "procwatch::worker", pid, index, files = files.len(), "Worker spawned");

    let mut monitor = MonitorClient::connect(&config.channel_path()).await?;
    monitor
        .register(&ProgramInfo::stamped(pid, config.spawner.describe(&spec)))
        .await?;
    let channel = MonitorClient::connect_worker(&config.runtime_dir, pid).await?;

    let exit = child
        .wait()
        .await
        .map_err(|source| RunnerError::Wait { pid, source })?;
    report_exit(channel, pid, exit).await?;

    let duration_ms = scrape_duration(&capture).await?;
    let status = monitor.status(pid).await?;
    monitor.done().await?;

    tracing::info!(
        target: "procwatch::worker",
        pid,
        exit = ?exit.code(),
        duration_ms = ?duration_ms,
        state = status.state.as_str(),
        "Worker finished"
    );

    Ok(WorkerReport {
        pid,
        files: files.to_vec(),
        exit_code: exit.code(),
        duration_ms,
        status,
    })
}

async fn report_exit(
    mut channel: MonitorClient,
    pid: i32,
    exit: ExitStatus,
) -> Result<(), ClientError> {
    if exit.success() {
        channel.complete(&ProgramInfo::stamped(pid, "")).await?;
        channel.done().await
    } else {
        channel.fail(&format!("worker {exit}")).await
    }
}

async fn scrape_duration(capture: &Path) -> Result<Option<u64>, RunnerError> {
    let capture_error = |source| RunnerError::Capture {
        path: capture.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(capture).await.map_err(capture_error)?;
    retrieve_time_from_file(&mut file).await.map_err(capture_error)
}
