//! Client side of the monitor protocol.
//!
//! One [`MonitorClient`] wraps one channel: the well-known channel for
//! registering workers and querying status, or a worker's own channel for
//! reporting completion.

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{
    DEFAULT_MAX_PAYLOAD, ErrorCode, ErrorReply, Frame, PipelineEntry, ProgramInfo, ProtocolError,
    RequestKind, StatusQuery,
};
use crate::bridge::transport::{self, worker_channel_path};
use crate::registry::StatusReport;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error("coordinator rejected request: {0}")]
    Rejected(ErrorReply),

    #[error("unexpected {got} reply to {request}")]
    UnexpectedReply {
        request: RequestKind,
        got: RequestKind,
    },
}

impl ClientError {
    /// Error code of a rejected request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected(reply) => Some(reply.code),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Rejected(reply) => Self::Rejected(reply),
            other => Self::Protocol(other),
        }
    }
}

pub struct MonitorClient<S = UnixStream> {
    framed: Framed<S, FrameCodec>,
}

impl MonitorClient<UnixStream> {
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = transport::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_stream(stream, DEFAULT_MAX_PAYLOAD))
    }

    /// Connect to the channel the coordinator opened for `pid`.
    pub async fn connect_worker(runtime_dir: &Path, pid: i32) -> Result<Self, ClientError> {
        Self::connect(&worker_channel_path(runtime_dir, pid)).await
    }
}

impl<S> MonitorClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S, max_payload: usize) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::with_max_payload(max_payload)),
        }
    }

    /// Send one frame and wait for its reply. An ERROR reply becomes
    /// [`ClientError::Rejected`].
    pub async fn request(&mut self, frame: Frame) -> Result<Frame, ClientError> {
        let kind = frame.kind;
        self.framed.send(frame).await?;

        let reply = match self.framed.next().await {
            Some(reply) => reply?,
            None => return Err(ProtocolError::Closed.into()),
        };
        tracing::trace!(request = %kind, reply = %reply.kind, "Reply received");

        if reply.kind == RequestKind::Error {
            return Err(ClientError::Rejected(reply.error_reply()));
        }
        Ok(reply)
    }

    async fn expect_ok(&mut self, frame: Frame) -> Result<(), ClientError> {
        let request = frame.kind;
        let reply = self.request(frame).await?;
        match reply.kind {
            RequestKind::Ok => Ok(()),
            got => Err(ClientError::UnexpectedReply { request, got }),
        }
    }

    /// NEW: start tracking `info.pid`.
    pub async fn register(&mut self, info: &ProgramInfo) -> Result<(), ClientError> {
        self.expect_ok(Frame::with_payload(RequestKind::New, info)?)
            .await?;
        tracing::debug!(pid = info.pid, "Registered with coordinator");
        Ok(())
    }

    /// UPDATE: mark `info.pid` completed.
    pub async fn complete(&mut self, info: &ProgramInfo) -> Result<(), ClientError> {
        self.expect_ok(Frame::with_payload(RequestKind::Update, info)?)
            .await
    }

    pub async fn pipeline(&mut self, entries: &[PipelineEntry]) -> Result<(), ClientError> {
        self.expect_ok(Frame::with_payload(RequestKind::Pipeline, &entries)?)
            .await
    }

    pub async fn status(&mut self, pid: i32) -> Result<StatusReport, ClientError> {
        let query = StatusQuery::One(ProgramInfo::stamped(pid, ""));
        Ok(self.query(&query).await?.decode()?)
    }

    /// Every tracked worker, in the order they were registered.
    pub async fn status_all(&mut self) -> Result<Vec<StatusReport>, ClientError> {
        Ok(self.query(&StatusQuery::All).await?.decode()?)
    }

    /// Reports for `pids`, in the order they were registered.
    pub async fn status_of(&mut self, pids: &[i32]) -> Result<Vec<StatusReport>, ClientError> {
        Ok(self.query(&StatusQuery::Pids(pids.to_vec())).await?.decode()?)
    }

    async fn query(&mut self, query: &StatusQuery) -> Result<Frame, ClientError> {
        let reply = self.request(query.to_frame()?).await?;
        match reply.kind {
            RequestKind::Status => Ok(reply),
            got => Err(ClientError::UnexpectedReply {
                request: RequestKind::Status,
                got,
            }),
        }
    }

    /// DONE: end the conversation and close the channel.
    pub async fn done(mut self) -> Result<(), ClientError> {
        self.expect_ok(Frame::empty(RequestKind::Done)).await
    }

    /// Report a failure on a worker channel and close it. The coordinator
    /// marks the worker failed with `reason`.
    pub async fn fail(mut self, reason: &str) -> Result<(), ClientError> {
        let frame = Frame {
            kind: RequestKind::Error,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        };
        self.framed.send(frame).await?;

        match self.framed.next().await {
            Some(Ok(reply)) if reply.kind == RequestKind::Ok => Ok(()),
            Some(Ok(reply)) if reply.kind == RequestKind::Error => {
                Err(ClientError::Rejected(reply.error_reply()))
            }
            Some(Ok(reply)) => Err(ClientError::UnexpectedReply {
                request: RequestKind::Error,
                got: reply.kind,
            }),
            Some(Err(e)) => Err(e.into()),
            None => Err(ProtocolError::Closed.into()),
        }
    }
}
