use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{MetashopError, Result};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a 4-byte length prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Outcome of reading one frame. End of stream and idle expiry are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    Frame(Bytes),
    /// The peer closed or reset the stream before a full frame arrived.
    Closed,
    TimedOut,
}

/// Encode the length prefix for a payload of `len` bytes.
pub fn frame_header(len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| MetashopError::FrameTooLarge {
        len,
        limit: MAX_PAYLOAD_LEN,
    })?;
    Ok(len.to_be_bytes())
}

/// Write one frame. Oversized payloads are rejected before any byte is written.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = frame_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, looping over partial reads until the declared length arrives.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<FrameRead>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return closed_or_error(e);
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(MetashopError::FrameTooLarge {
            len,
            limit: max_len,
        });
    }

    let mut payload = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut payload).await {
        debug!(expected = len, "stream ended inside a frame payload");
        return closed_or_error(e);
    }

    Ok(FrameRead::Frame(Bytes::from(payload)))
}

/// [`read_frame`] bounded by an idle timeout.
pub async fn read_frame_timeout<R>(
    reader: &mut R,
    max_len: usize,
    idle: Duration,
) -> Result<FrameRead>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle, read_frame(reader, max_len)).await {
        Ok(result) => result,
        Err(_) => Ok(FrameRead::TimedOut),
    }
}

fn closed_or_error(e: io::Error) -> Result<FrameRead> {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => Ok(FrameRead::Closed),
        _ => Err(MetashopError::Io(e)),
    }
}
