//! Length-prefixed frame I/O over async byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{Message, WireError, MIN_MESSAGE_LEN};

use super::DaemonError;

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
/// Declared lengths outside `MIN_MESSAGE_LEN..=max_len` are fatal for the
/// connection. Content is not validated here.
pub async fn read_frame<R>(rd: &mut R, max_len: usize) -> Result<Option<Message>, DaemonError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match rd.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let declared = u32::from_be_bytes(prefix);
    let len = usize::try_from(declared).map_err(|_| DaemonError::FrameLength(declared))?;
    if !(MIN_MESSAGE_LEN..=max_len).contains(&len) {
        return Err(DaemonError::FrameLength(declared));
    }

    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| WireError::AllocationFailed(len))?;
    buf.extend_from_slice(&prefix);
    buf.resize(len, 0);
    let rest = buf
        .get_mut(prefix.len()..)
        .ok_or(DaemonError::FrameLength(declared))?;
    rd.read_exact(rest).await?;
    Ok(Some(Message::from_bytes(buf)))
}

/// Write one frame.
pub async fn write_frame<W>(wr: &mut W, msg: &Message) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(msg.as_bytes()).await?;
    Ok(())
}
