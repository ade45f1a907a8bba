//! Envelope codec: every wire message is `[u32 length, little-endian]`
//! followed by exactly `length` payload bytes. No partial-frame state
//! is kept across calls; message boundaries need not align with
//! transport packets.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEAD_LEN: usize = 4;

/// Upper bound on a single payload. Bounded, but large enough for any
/// reasonable argument blob.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one complete frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload {} exceeds limit", payload.len()),
        ));
    }
    let head = (payload.len() as u32).to_le_bytes();
    w.write_all(&head).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read exactly one frame into `buf` (resized to the payload length).
/// Fails if the stream errs or closes mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, buf: &mut BytesMut) -> io::Result<()> {
    let mut head = [0u8; FRAME_HEAD_LEN];
    r.read_exact(&mut head).await?;
    let len = u32::from_le_bytes(head) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }
    buf.resize(len, 0);
    if len > 0 {
        r.read_exact(&mut buf[..]).await?;
    }
    Ok(())
}
