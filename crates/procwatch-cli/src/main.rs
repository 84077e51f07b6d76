//! procwatch command-line front end.

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use procwatch::sharder::DEFAULT_MAX_FILES_PER_FORK;
use procwatch::{
    CommandSpawner, Coordinator, CoordinatorConfig, MonitorClient, RunnerConfig, run_batch,
    shutdown_signal,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the coordinator's channels (overrides PROCWATCH_RUNTIME_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// File name of the well-known channel inside the runtime directory
    #[arg(long, global = true, value_name = "NAME")]
    channel: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until SIGINT or SIGTERM
    Serve {
        /// Maximum number of tracked workers
        #[arg(long)]
        capacity: Option<usize>,

        /// Drop finished workers after this many seconds (0 keeps them)
        #[arg(long, value_name = "SECS")]
        retention_secs: Option<u64>,

        /// Seconds a worker has to connect to its channel
        #[arg(long, value_name = "SECS")]
        connect_timeout_secs: Option<u64>,
    },

    /// Shard files over worker processes and report them to the coordinator
    Run {
        /// Files handed to the workers
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Worker command; each worker gets its files appended
        #[arg(last = true, required = true)]
        command: Vec<String>,

        /// Upper bound on files per worker
        #[arg(long, default_value_t = DEFAULT_MAX_FILES_PER_FORK)]
        max_files_per_fork: usize,

        /// Where worker output is captured
        #[arg(long, value_name = "DIR")]
        capture_dir: Option<PathBuf>,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what the coordinator knows about workers (all of them when no
    /// pid is given)
    Status {
        /// Worker pids, as `4242` or `PID-4242`
        #[arg(value_parser = parse_pid)]
        pids: Vec<i32>,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    logging::init_tracing();
    let cli = Cli::parse();

    let mut config = CoordinatorConfig::from_env()?;
    if let Some(dir) = cli.runtime_dir {
        config.runtime_dir = dir;
    }
    if let Some(name) = cli.channel {
        config.channel_name = name;
    }

    match cli.command {
        Commands::Serve {
            capacity,
            retention_secs,
            connect_timeout_secs,
        } => {
            if let Some(capacity) = capacity {
                config = config.with_capacity(capacity);
            }
            if let Some(secs) = retention_secs {
                config = config.with_retention((secs > 0).then(|| Duration::from_secs(secs)));
            }
            if let Some(secs) = connect_timeout_secs {
                config = config.with_worker_connect_timeout(Duration::from_secs(secs));
            }
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            files,
            command,
            max_files_per_fork,
            capture_dir,
            json,
        } => {
            let spawner = CommandSpawner::from_command_line(&command)?;
            let mut runner = RunnerConfig::new(Arc::new(spawner))
                .with_runtime_dir(config.runtime_dir)
                .with_channel_name(config.channel_name)
                .with_max_files_per_fork(max_files_per_fork);
            if let Some(dir) = capture_dir {
                runner = runner.with_capture_dir(dir);
            }
            run(&runner, &files, json).await
        }
        Commands::Status { pids, json } => {
            status(&config, &pids, json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(config: CoordinatorConfig) -> Result<()> {
    let coordinator = Coordinator::bind(config)?;
    let registry = coordinator.run(shutdown_signal()).await?;
    tracing::info!(tracked = registry.len(), "Shutdown complete");
    Ok(())
}

async fn run(config: &RunnerConfig, files: &[PathBuf], json: bool) -> Result<ExitCode> {
    let reports = run_batch(config, files)
        .await
        .context("batch did not complete")?;

    for report in &reports {
        if json {
            println!("{}", serde_json::to_string(&report.status)?);
        } else {
            let duration = match report.duration_ms {
                Some(ms) => format!("{ms} ms"),
                None => "unknown".to_string(),
            };
            println!(
                "{} ({} files, reported duration {duration})",
                report.status,
                report.files.len()
            );
        }
    }

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        tracing::warn!(failed, workers = reports.len(), "Some workers failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn status(config: &CoordinatorConfig, pids: &[i32], json: bool) -> Result<()> {
    let mut client = MonitorClient::connect(&config.channel_path()).await?;
    let reports = if pids.is_empty() {
        client.status_all().await?
    } else {
        client.status_of(pids).await?
    };
    client.done().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if reports.is_empty() {
        println!("no workers tracked");
    } else {
        for report in &reports {
            println!("{report}");
        }
    }
    Ok(())
}

/// Accept a bare pid or the `PID-<n>` form.
fn parse_pid(arg: &str) -> Result<i32, String> {
    let digits = arg.strip_prefix("PID-").unwrap_or(arg);
    digits
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| format!("`{arg}` is not a pid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_splits_files_from_command() {
        let cli = Cli::try_parse_from([
            "procwatch",
            "--runtime-dir",
            "/tmp/pw",
            "run",
            "a.rs",
            "b.rs",
            "--max-files-per-fork",
            "1",
            "--",
            "cargo",
            "test",
        ])
        .unwrap();

        assert_eq!(cli.runtime_dir, Some(PathBuf::from("/tmp/pw")));
        match cli.command {
            Commands::Run {
                files,
                command,
                max_files_per_fork,
                ..
            } => {
                assert_eq!(files, vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")]);
                assert_eq!(command, vec!["cargo".to_string(), "test".to_string()]);
                assert_eq!(max_files_per_fork, 1);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn status_takes_pids() {
        let cli = Cli::try_parse_from(["procwatch", "status", "4242", "PID-17", "--json"]).unwrap();
        match cli.command {
            Commands::Status { pids, json } => {
                assert_eq!(pids, vec![4242, 17]);
                assert!(json);
            }
            _ => panic!("expected status"),
        }

        let cli = Cli::try_parse_from(["procwatch", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { ref pids, json: false } if pids.is_empty()));
    }

    #[test]
    fn parse_pid_forms() {
        assert_eq!(parse_pid("42"), Ok(42));
        assert_eq!(parse_pid("PID-42"), Ok(42));
        assert!(parse_pid("PID-").is_err());
        assert!(parse_pid("-3").is_err());
        assert!(parse_pid("abc").is_err());
    }
}
