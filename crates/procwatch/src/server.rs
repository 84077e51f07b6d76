//! Coordinator server - channel accept loop and registry owner.
//!
//! Flow:
//! 1. Bind the well-known channel, accept client connections
//! 2. One session task per connection decodes frames and forwards them
//! 3. The run loop owns the [`Dispatcher`] and answers each request in turn
//! 4. A NEW that admits a worker binds that worker's channel before OK is sent
//! 5. A worker channel that breaks before UPDATE marks the worker failed

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Interval;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{ErrorCode, Frame, RequestKind};
use crate::bridge::transport::{ChannelListener, prepare_runtime_dir, worker_channel_path};
use crate::config::CoordinatorConfig;
use crate::dispatcher::{Dispatched, Dispatcher};
use crate::registry::Registry;

/// Where a session's connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    WellKnown,
    /// A worker's own channel, opened for the registry entry with `serial`.
    Worker { pid: i32, serial: u64 },
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WellKnown => f.write_str("well-known"),
            Self::Worker { pid, .. } => write!(f, "worker {pid}"),
        }
    }
}

enum Command {
    Dispatch {
        kind: RequestKind,
        payload: Bytes,
        reply: oneshot::Sender<Frame>,
    },
    WorkerFailed {
        pid: i32,
        serial: u64,
        reason: String,
        ack: Option<oneshot::Sender<()>>,
    },
}

struct Session {
    origin: Origin,
    stream: UnixStream,
    /// Worker channels keep their listener until the session ends, so the
    /// socket file disappears with the session.
    listener: Option<ChannelListener>,
}

/// How a session ended.
enum SessionEnd {
    Done,
    Closed,
    Broken(String),
    Reported(String),
    Shutdown,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Registry,
    listener: ChannelListener,
}

impl Coordinator {
    /// Create the registry and bind the well-known channel.
    ///
    /// Fails if the registry's capacity cannot be reserved or the channel
    /// cannot be bound.
    pub fn bind(config: CoordinatorConfig) -> anyhow::Result<Self> {
        prepare_runtime_dir(&config.runtime_dir).with_context(|| {
            format!("failed to create runtime dir {}", config.runtime_dir.display())
        })?;

        let registry = Registry::new(config.capacity).context("failed to create registry")?;

        let path = config.channel_path();
        let listener = ChannelListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;

        Ok(Self {
            config,
            registry,
            listener,
        })
    }

    pub fn channel_path(&self) -> &Path {
        self.listener.path()
    }

    /// Serve until `shutdown` resolves, then return the registry.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<Registry> {
        let Coordinator {
            config,
            registry,
            listener,
        } = self;

        tracing::info!(
            channel = %listener.path().display(),
            capacity = registry.capacity(),
            retention = ?config.retention,
            "Coordinator listening"
        );

        let mut dispatcher = Dispatcher::new(registry);
        let mut tasks: JoinSet<()> = JoinSet::new();
        let (command_tx, mut command_rx) = mpsc::channel::<Command>(64);
        let (session_tx, mut session_rx) = mpsc::channel::<Session>(16);
        let mut sweep = config.retention.map(sweep_interval);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Coordinator shutting down");
                    break;
                }

                Some(command) = command_rx.recv() => match command {
                    Command::Dispatch { kind, payload, reply } => {
                        let Dispatched { reply: frame, admitted } = dispatcher.deal(kind, &payload);
                        for pid in admitted {
                            let Some(serial) = dispatcher.registry().get(pid).map(|r| r.serial()) else {
                                continue;
                            };
                            open_worker_channel(&config, pid, serial, &mut tasks, &session_tx);
                        }
                        if reply.send(frame).is_err() {
                            tracing::debug!(%kind, "Session gone before reply");
                        }
                    }
                    Command::WorkerFailed { pid, serial, reason, ack } => {
                        dispatcher.worker_failed(pid, serial, &reason);
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                },

                Some(session) = session_rx.recv() => {
                    tasks.spawn(run_session(session, command_tx.clone(), config.max_payload));
                }

                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let session = Session {
                            origin: Origin::WellKnown,
                            stream,
                            listener: None,
                        };
                        tasks.spawn(run_session(session, command_tx.clone(), config.max_payload));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "Session task panicked");
                    }
                }

                _ = tick(&mut sweep) => {
                    if let Some(max_age) = config.retention {
                        let removed = dispatcher.expire(max_age);
                        if removed > 0 {
                            tracing::info!(removed, "Expired finished workers");
                        }
                    }
                }
            }
        }

        tasks.shutdown().await;
        drop(listener);

        let registry = dispatcher.into_registry();
        for report in registry.statuses() {
            tracing::info!(target: "procwatch::worker", "{report}");
        }
        tracing::info!(tracked = registry.len(), "Coordinator stopped");

        Ok(registry)
    }
}

/// Bind the worker's channel and wait for its client in the background.
///
/// A failure here leaves the worker registered; it can still report over the
/// well-known channel.
fn open_worker_channel(
    config: &CoordinatorConfig,
    pid: i32,
    serial: u64,
    tasks: &mut JoinSet<()>,
    sessions: &mpsc::Sender<Session>,
) {
    let origin = Origin::Worker { pid, serial };
    let path = worker_channel_path(&config.runtime_dir, pid);
    let listener = match ChannelListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(pid, path = %path.display(), error = %e, "Failed to bind worker channel");
            return;
        }
    };

    let timeout = config.worker_connect_timeout;
    let sessions = sessions.clone();
    tasks.spawn(async move {
        match tokio::time::timeout(timeout, listener.accept()).await {
            Ok(Ok(stream)) => {
                tracing::debug!(pid, "Worker channel connected");
                let session = Session {
                    origin,
                    stream,
                    listener: Some(listener),
                };
                let _ = sessions.send(session).await;
            }
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "Worker channel accept failed"),
            Err(_) => tracing::warn!(pid, ?timeout, "Worker channel not connected in time"),
        }
    });
}

async fn run_session(session: Session, commands: mpsc::Sender<Command>, max_payload: usize) {
    let Session {
        origin,
        stream,
        listener,
    } = session;
    let mut framed = Framed::new(stream, FrameCodec::with_max_payload(max_payload));
    tracing::debug!(%origin, "Session started");

    let end = loop {
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                if e.is_violation() {
                    let reply = Frame::error(ErrorCode::ProtocolViolation, e.to_string());
                    let _ = framed.send(reply).await;
                }
                break SessionEnd::Broken(e.to_string());
            }
            None => break SessionEnd::Closed,
        };

        if let (Origin::Worker { pid, serial }, RequestKind::Error) = (origin, frame.kind) {
            let reason = frame.error_reply().message;
            let (ack_tx, ack_rx) = oneshot::channel();
            let failed = Command::WorkerFailed {
                pid,
                serial,
                reason: reason.clone(),
                ack: Some(ack_tx),
            };
            if commands.send(failed).await.is_err() || ack_rx.await.is_err() {
                break SessionEnd::Shutdown;
            }
            let _ = framed.send(Frame::ok()).await;
            break SessionEnd::Reported(reason);
        }

        let kind = frame.kind;
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Dispatch {
            kind,
            payload: frame.payload,
            reply: reply_tx,
        };
        if commands.send(command).await.is_err() {
            break SessionEnd::Shutdown;
        }
        let Ok(reply) = reply_rx.await else {
            break SessionEnd::Shutdown;
        };

        if let Err(e) = framed.send(reply).await {
            break SessionEnd::Broken(e.to_string());
        }
        if kind == RequestKind::Done {
            break SessionEnd::Done;
        }
    };
    drop(listener);

    match (origin, end) {
        (Origin::Worker { pid, serial }, SessionEnd::Closed) => {
            report_failure(&commands, pid, serial, "channel closed".to_string()).await;
        }
        (Origin::Worker { pid, serial }, SessionEnd::Broken(reason)) => {
            tracing::warn!(pid, %reason, "Worker channel broken");
            report_failure(&commands, pid, serial, reason).await;
        }
        (origin, SessionEnd::Broken(reason)) => {
            tracing::warn!(%origin, %reason, "Dropping connection");
        }
        (origin, SessionEnd::Reported(reason)) => {
            tracing::debug!(%origin, %reason, "Worker reported failure");
        }
        (origin, SessionEnd::Done | SessionEnd::Closed | SessionEnd::Shutdown) => {
            tracing::debug!(%origin, "Session ended");
        }
    }
}

async fn report_failure(commands: &mpsc::Sender<Command>, pid: i32, serial: u64, reason: String) {
    let command = Command::WorkerFailed {
        pid,
        serial,
        reason,
        ack: None,
    };
    if commands.send(command).await.is_err() {
        tracing::debug!(pid, "Coordinator stopped before failure was recorded");
    }
}

fn sweep_interval(retention: Duration) -> Interval {
    let period = retention.clamp(Duration::from_millis(100), Duration::from_secs(60));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
