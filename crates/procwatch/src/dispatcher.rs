//! Request dispatcher - turns decoded requests into registry operations.
//!
//! The dispatcher owns the registry. It performs no I/O: callers hand it a
//! request kind and payload and write the returned reply frame back on the
//! channel the request came from.

use std::time::Duration;

use crate::bridge::protocol::{
    ErrorCode, Frame, PipelineEntry, ProgramInfo, ProtocolError, RequestKind, StatusQuery,
    decode_payload,
};
use crate::registry::{Registry, RegistryError};

/// Outcome of one request.
#[derive(Debug)]
pub struct Dispatched {
    pub reply: Frame,
    /// Pids that started being tracked by this request.
    pub admitted: Vec<i32>,
}

impl Dispatched {
    fn reply(reply: Frame) -> Self {
        Self {
            reply,
            admitted: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0} is not a request")]
    Unsupported(RequestKind),
}

impl DispatchError {
    pub fn to_frame(&self) -> Frame {
        let code = match self {
            Self::Registry(e) => e.code(),
            Self::Protocol(_) => ErrorCode::ProtocolViolation,
            Self::Unsupported(_) => ErrorCode::Unsupported,
        };
        Frame::error(code, self.to_string())
    }
}

pub struct Dispatcher {
    registry: Registry,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Release the registry (coordinator shutdown).
    pub fn into_registry(self) -> Registry {
        self.registry
    }

    /// Handle one request and build the reply: OK for NEW / UPDATE /
    /// PIPELINE / DONE, a STATUS frame (one report or a list) for STATUS,
    /// ERROR otherwise.
    pub fn deal(&mut self, kind: RequestKind, payload: &[u8]) -> Dispatched {
        match self.try_deal(kind, payload) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                tracing::debug!(%kind, error = %e, "Request rejected");
                Dispatched::reply(e.to_frame())
            }
        }
    }

    fn try_deal(&mut self, kind: RequestKind, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        match kind {
            RequestKind::New | RequestKind::Update => {
                let info = ProgramInfo::from_payload(payload)?;
                let admitted = self.store(kind, &info)?;
                Ok(Dispatched {
                    reply: Frame::ok(),
                    admitted: admitted.into_iter().collect(),
                })
            }
            RequestKind::Status => {
                let reply = match StatusQuery::from_payload(payload)? {
                    StatusQuery::One(info) => {
                        Frame::with_payload(RequestKind::Status, &self.registry.status(info.pid)?)?
                    }
                    StatusQuery::All => {
                        Frame::with_payload(RequestKind::Status, &self.registry.statuses())?
                    }
                    StatusQuery::Pids(pids) => {
                        Frame::with_payload(RequestKind::Status, &self.registry.statuses_of(&pids)?)?
                    }
                };
                Ok(Dispatched::reply(reply))
            }
            RequestKind::Pipeline => {
                let entries: Vec<PipelineEntry> = decode_payload(payload)?;
                for entry in &entries {
                    entry.info.validate()?;
                }
                let admitted = self.registry.apply_batch(&entries)?;
                tracing::debug!(entries = entries.len(), admitted = admitted.len(), "Pipeline applied");
                for pid in &admitted {
                    tracing::info!(target: "procwatch::worker", pid, "Worker registered");
                }
                Ok(Dispatched {
                    reply: Frame::ok(),
                    admitted,
                })
            }
            RequestKind::Done => Ok(Dispatched::reply(Frame::ok())),
            RequestKind::Error | RequestKind::Ok => Err(DispatchError::Unsupported(kind)),
        }
    }

    /// Route a lifecycle message: NEW inserts, UPDATE completes. Returns the
    /// pid when it was newly admitted.
    pub fn store(&mut self, kind: RequestKind, info: &ProgramInfo) -> Result<Option<i32>, DispatchError> {
        match kind {
            RequestKind::New => {
                self.registry.insert(info)?;
                tracing::info!(
                    target: "procwatch::worker",
                    pid = info.pid,
                    command = %info.name,
                    "Worker registered"
                );
                Ok(Some(info.pid))
            }
            RequestKind::Update => {
                let request = self.registry.update(info)?;
                tracing::info!(
                    target: "procwatch::worker",
                    pid = info.pid,
                    elapsed = %request.elapsed().unwrap_or_default(),
                    "Worker completed"
                );
                Ok(None)
            }
            other => Err(DispatchError::Unsupported(other)),
        }
    }

    /// Mark a running worker failed after its channel broke.
    ///
    /// `serial` names the entry the channel was opened for. If the pid has
    /// since been expired and registered again, the report is dropped.
    pub fn worker_failed(&mut self, pid: i32, serial: u64, reason: &str) {
        if let Some(current) = self.registry.get(pid).map(|r| r.serial())
            && current != serial
        {
            tracing::debug!(pid, serial, current, %reason, "Ignoring channel of a replaced entry");
            return;
        }
        match self.registry.mark_failed(pid, reason) {
            Ok(true) => tracing::warn!(target: "procwatch::worker", pid, %reason, "Worker failed"),
            Ok(false) => tracing::debug!(pid, %reason, "Channel ended after worker finished"),
            Err(e) => tracing::warn!(pid, error = %e, "Cannot mark worker failed"),
        }
    }

    pub fn expire(&mut self, max_age: Duration) -> usize {
        self.registry.expire_finished(max_age)
    }
}
