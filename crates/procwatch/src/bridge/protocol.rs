//! Wire protocol types for client-coordinator communication.
//!
//! Every message is a fixed 12-byte header followed by `size` payload bytes:
//!
//! ```text
//! [kind: u32 LE][size: u64 LE][payload: size bytes]
//! ```
//!
//! Payloads are JSON. NEW / UPDATE carry a [`ProgramInfo`], PIPELINE carries a
//! list of [`PipelineEntry`] and ERROR carries an [`ErrorReply`]. STATUS takes
//! one of the [`StatusQuery`] forms and is answered with one
//! [`StatusReport`](crate::registry::StatusReport) or a list of them. OK and
//! DONE have no payload.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use crate::time::Timeval;

/// Encoded header length: kind (4 bytes) + payload size (8 bytes).
pub const HEADER_LEN: usize = 12;

/// Longest process name a [`ProgramInfo`] may carry, in bytes.
pub const MAX_NAME_LEN: usize = 49;

/// Microseconds per second; a sub-second timestamp is below this.
pub const USEC_PER_SEC: i64 = 1_000_000;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Message type tag. Discriminants are the on-wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum RequestKind {
    New = 0,
    Pipeline = 1,
    Status = 2,
    Update = 3,
    Error = 4,
    Done = 5,
    Ok = 6,
}

impl RequestKind {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::New,
            1 => Self::Pipeline,
            2 => Self::Status,
            3 => Self::Update,
            4 => Self::Error,
            5 => Self::Done,
            6 => Self::Ok,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Pipeline => "PIPELINE",
            Self::Status => "STATUS",
            Self::Update => "UPDATE",
            Self::Error => "ERROR",
            Self::Done => "DONE",
            Self::Ok => "OK",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol envelope written immediately before every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: RequestKind,
    pub size: u64,
}

impl Header {
    pub fn new(kind: RequestKind, size: u64) -> Self {
        Self { kind, size }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32_le(self.kind.as_u32());
        dst.put_u64_le(self.size);
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        let Some(bytes) = src.get(..HEADER_LEN) else {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                received: src.len(),
            });
        };
        let mut kind = [0u8; 4];
        let mut size = [0u8; 8];
        kind.copy_from_slice(&bytes[..4]);
        size.copy_from_slice(&bytes[4..]);

        let raw_kind = u32::from_le_bytes(kind);
        let kind = RequestKind::from_u32(raw_kind).ok_or(ProtocolError::UnknownKind(raw_kind))?;
        Ok(Self {
            kind,
            size: u64::from_le_bytes(size),
        })
    }
}

/// A decoded message: kind plus owned payload bytes (empty when size is zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: RequestKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn empty(kind: RequestKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::empty(RequestKind::Ok)
    }

    pub fn with_payload<T: Serialize>(kind: RequestKind, value: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            payload: encode_payload(value)?,
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let reply = ErrorReply::new(code, message);
        let payload = serde_json::to_vec(&reply).map(Bytes::from).unwrap_or_default();
        Self {
            kind: RequestKind::Error,
            payload,
        }
    }

    pub fn header(&self) -> Header {
        Header::new(self.kind, self.payload.len() as u64)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(&self.payload)
    }

    /// Interpret an ERROR frame's payload, tolerating peers that send plain text.
    pub fn error_reply(&self) -> ErrorReply {
        serde_json::from_slice(&self.payload).unwrap_or_else(|_| {
            ErrorReply::new(
                ErrorCode::ProtocolViolation,
                String::from_utf8_lossy(&self.payload).into_owned(),
            )
        })
    }
}

/// Identity of a monitored process as sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub pid: i32,
    pub name: String,
    /// Sub-second component of the client's clock, in microseconds.
    pub timestamp: i64,
}

impl ProgramInfo {
    /// Build a `ProgramInfo`, truncating `name` to [`MAX_NAME_LEN`] bytes.
    pub fn new(pid: i32, name: impl Into<String>, timestamp: i64) -> Self {
        let mut name = name.into();
        if name.len() > MAX_NAME_LEN {
            tracing::debug!(pid, len = name.len(), "Truncating program name");
            truncate_at_boundary(&mut name, MAX_NAME_LEN);
        }
        Self {
            pid,
            name,
            timestamp,
        }
    }

    /// Build a `ProgramInfo` stamped with the current sub-second time.
    pub fn stamped(pid: i32, name: impl Into<String>) -> Self {
        Self::new(pid, name, Timeval::now().usec)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(ProtocolError::NameTooLong {
                len: self.name.len(),
            });
        }
        if !(0..USEC_PER_SEC).contains(&self.timestamp) {
            return Err(ProtocolError::TimestampOutOfRange(self.timestamp));
        }
        Ok(())
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let info: Self = decode_payload(payload)?;
        info.validate()?;
        Ok(info)
    }
}

/// What a STATUS request asks about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQuery {
    /// One process; answered with a single report.
    One(ProgramInfo),
    /// Every tracked process, in insertion order. Sent as an empty payload.
    All,
    /// The listed pids, answered in insertion order. Sent as a JSON array.
    Pids(Vec<i32>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusPayload {
    One(ProgramInfo),
    Pids(Vec<i32>),
}

impl StatusQuery {
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Ok(Self::All);
        }
        match decode_payload(payload)? {
            StatusPayload::One(info) => {
                info.validate()?;
                Ok(Self::One(info))
            }
            StatusPayload::Pids(pids) => Ok(Self::Pids(pids)),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        match self {
            Self::One(info) => Frame::with_payload(RequestKind::Status, info),
            Self::All => Ok(Frame::empty(RequestKind::Status)),
            Self::Pids(pids) => Frame::with_payload(RequestKind::Status, pids),
        }
    }

    /// True when the reply carries a list of reports.
    pub fn is_list(&self) -> bool {
        !matches!(self, Self::One(_))
    }
}

/// Operation carried inside a PIPELINE batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOp {
    New,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEntry {
    pub op: PipelineOp,
    pub info: ProgramInfo,
}

impl PipelineEntry {
    pub fn new_process(info: ProgramInfo) -> Self {
        Self {
            op: PipelineOp::New,
            info,
        }
    }

    pub fn update(info: ProgramInfo) -> Self {
        Self {
            op: PipelineOp::Update,
            info,
        }
    }
}

/// Machine-readable reason carried by ERROR replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RegistryFull,
    NotFound,
    AlreadyTracked,
    AlreadyFinished,
    ProtocolViolation,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("unknown request kind {0}")]
    UnknownKind(u32),

    #[error("payload of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: u64, max: usize },

    #[error("frame truncated: expected {expected} bytes, got {received}")]
    Truncated { expected: usize, received: usize },

    #[error("channel closed")]
    Closed,

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("program name is {len} bytes, limit is {}", MAX_NAME_LEN)]
    NameTooLong { len: usize },

    #[error("sub-second timestamp {0} is outside 0..{max}", max = USEC_PER_SEC)]
    TimestampOutOfRange(i64),

    #[error("peer reported error: {0}")]
    Rejected(ErrorReply),
}

impl ProtocolError {
    /// True when the channel can no longer be trusted to be in sync.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownKind(_)
                | Self::FrameTooLarge { .. }
                | Self::Truncated { .. }
                | Self::Payload(_)
                | Self::NameTooLong { .. }
                | Self::TimestampOutOfRange(_)
        )
    }
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Payload(e.to_string()))
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Payload(e.to_string()))
}

/// Truncate `s` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
