//! Newline framing with a size limit, for blocking and async readers.

use std::io::{self, BufRead, Read};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Outcome of reading one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Frame {
    /// A complete line is in the buffer, newline (and `\r`) stripped
    Line,
    /// The line exceeded the limit and was discarded through its newline
    TooLarge,
    /// End of stream after this many bytes of an unterminated line
    Partial(usize),
    /// End of stream on a frame boundary
    Eof,
}

fn finish(buf: &mut Vec<u8>, read: usize, limit: u64) -> Option<Frame> {
    if read == 0 {
        return Some(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Some(Frame::Line);
    }
    if (read as u64) < limit {
        return Some(Frame::Partial(read));
    }
    None
}

/// Read one frame of at most `max` bytes (plus its newline) into `buf`.
pub(crate) async fn read_frame_async<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = (max as u64).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if let Some(frame) = finish(buf, read, limit) {
        return Ok(frame);
    }

    buf.clear();
    loop {
        let (consumed, found) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(Frame::Partial(read));
            }
            match available.iter().position(|byte| *byte == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(Frame::TooLarge);
        }
    }
}

/// Blocking counterpart of [`read_frame_async`].
pub(crate) fn read_frame<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<Frame> {
    buf.clear();
    let limit = (max as u64).saturating_add(1);
    let read = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if let Some(frame) = finish(buf, read, limit) {
        return Ok(frame);
    }

    buf.clear();
    loop {
        let (consumed, found) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                return Ok(Frame::Partial(read));
            }
            match available.iter().position(|byte| *byte == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(Frame::TooLarge);
        }
    }
}
