//! Framed codec for channel communication.
//!
//! Reads a fixed-size [`Header`], then exactly `header.size` payload bytes.
//! Works over any AsyncRead/AsyncWrite (sockets, pipes, in-memory duplex).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{DEFAULT_MAX_PAYLOAD, Frame, HEADER_LEN, Header, ProtocolError, RequestKind};

/// Codec for `[kind][size][payload]` frames.
///
/// Keeps the decoded header between calls so a payload that arrives in several
/// reads is not re-parsed.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload: usize,
    pending: Option<Header>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload,
            pending: None,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn check_size(&self, size: u64) -> Result<usize, ProtocolError> {
        match usize::try_from(size) {
            Ok(n) if n <= self.max_payload => Ok(n),
            _ => Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_payload,
            }),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = Header::decode(&src[..HEADER_LEN])?;
                self.check_size(header.size)?;
                src.advance(HEADER_LEN);
                self.pending = Some(header);
                header
            }
        };

        let size = header.size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(size).freeze();
        tracing::trace!(kind = %header.kind, size, "Decoded frame");
        Ok(Some(Frame {
            kind: header.kind,
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        match self.pending.take() {
            Some(header) => Err(ProtocolError::Truncated {
                expected: header.size as usize,
                received: buf.len(),
            }),
            None if buf.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                received: buf.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len();
        self.check_size(size as u64)?;

        dst.reserve(HEADER_LEN + size);
        item.header().encode(dst);
        dst.extend_from_slice(&item.payload);
        tracing::trace!(kind = %item.kind, size, "Encoded frame");
        Ok(())
    }
}

/// Write one frame: header, then `payload` (nothing when empty).
///
/// Header and payload go out in a single `write_all`, so the frame either
/// reaches the channel whole or the call fails. Returns total bytes written.
pub async fn write_frame<W>(
    channel: &mut W,
    kind: RequestKind,
    payload: &[u8],
) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    Header::new(kind, payload.len() as u64).encode(&mut buf);
    buf.extend_from_slice(payload);

    channel.write_all(&buf).await?;
    channel.flush().await?;
    Ok(buf.len())
}

/// Read one frame, waiting for the full header and then the full payload.
///
/// An ERROR frame is returned as [`ProtocolError::Rejected`]; the caller
/// decides whether the conversation can continue.
pub async fn read_frame<R>(channel: &mut R, max_payload: usize) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = channel.read(&mut raw[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ProtocolError::Closed
            } else {
                ProtocolError::Truncated {
                    expected: HEADER_LEN,
                    received: filled,
                }
            });
        }
        filled += n;
    }

    let header = Header::decode(&raw)?;
    let size = FrameCodec::with_max_payload(max_payload).check_size(header.size)?;

    let mut payload = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = channel.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated {
                expected: size,
                received: filled,
            });
        }
        filled += n;
    }

    let frame = Frame {
        kind: header.kind,
        payload: payload.into(),
    };
    if frame.kind == RequestKind::Error {
        return Err(ProtocolError::Rejected(frame.error_reply()));
    }
    Ok(frame)
}
