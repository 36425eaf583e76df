//! Async framing over a byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecError, ENVELOPE_SIZE, Message, decode_message};
use crate::Result;

/// Limits applied to inbound messages.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    /// Largest accepted payload, excluding the envelope.
    pub max_payload: usize,
    /// Largest key plus value accepted in a frame.
    pub entry_size: usize,
}

/// Read one message. Returns `Ok(None)` on a clean end of stream between
/// messages.
pub async fn read_message<R>(reader: &mut R, limits: ReadLimits) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; ENVELOPE_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let tag = header[0];
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[1..]);
    let len = u32::from_be_bytes(len) as usize;
    if len > limits.max_payload {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            max: limits.max_payload,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_message(tag, &payload, limits.entry_size)?))
}

/// Write one already enveloped message.
pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}
