//! Scrape a worker's self-reported duration from its captured output.
//!
//! Workers (test runners and the like) print a line such as
//! `DURATION[ms]: 452`. This is best effort: `None` means "duration unknown",
//! which callers must not read as zero.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub const DURATION_MARKER: &[u8] = b"DURATION[ms]: ";

const CHUNK_SIZE: usize = 1024;

/// Longest digit run accepted after the marker (`u64::MAX` has 20 digits).
const MAX_DIGITS: usize = 20;

enum Scan {
    Found(Option<u64>),
    NeedMore,
    Absent,
}

/// Read `channel` in fixed-size chunks until a duration marker is found and
/// return its value in milliseconds.
///
/// A marker split across chunk boundaries is still recognised. Returns
/// `Ok(None)` if the stream ends without a marker or the marker is not
/// followed by an integer.
pub async fn retrieve_time_from_file<R>(channel: &mut R) -> io::Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut window: Vec<u8> = Vec::with_capacity(CHUNK_SIZE * 2);

    loop {
        let n = channel.read(&mut chunk).await?;
        let eof = n == 0;
        window.extend_from_slice(&chunk[..n]);

        match scan(&window, eof) {
            Scan::Found(value) => {
                tracing::trace!(duration_ms = ?value, "Duration marker found");
                return Ok(value);
            }
            Scan::NeedMore => {}
            Scan::Absent if eof => return Ok(None),
            Scan::Absent => {
                // Keep just enough tail for a marker straddling the next chunk.
                let keep = DURATION_MARKER.len() - 1;
                if window.len() > keep {
                    window.drain(..window.len() - keep);
                }
            }
        }
    }
}

fn scan(window: &[u8], eof: bool) -> Scan {
    let Some(pos) = find(window, DURATION_MARKER) else {
        return Scan::Absent;
    };

    let rest = &window[pos + DURATION_MARKER.len()..];
    let start = rest
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(rest.len());
    let digits = &rest[start..];
    let len = digits
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());

    let terminated = len < digits.len() || eof;
    if !terminated && len <= MAX_DIGITS {
        return Scan::NeedMore;
    }
    if len == 0 || len > MAX_DIGITS {
        return Scan::Found(None);
    }
    let value = std::str::from_utf8(&digits[..len])
        .ok()
        .and_then(|s| s.parse::<u64>().ok());
    Scan::Found(value)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
