//! Length-delimited wire-message framing for stream transports.
//!
//! Frame layout on a logical sub-stream:
//!
//! ```text
//! ┌──────────────┬───────────────────────────┐
//! │ len (u32 LE) │ codec-encoded WireMessage │
//! └──────────────┴───────────────────────────┘
//! ```
//!
//! The length covers the encoded message only, not the prefix.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::PayloadCodec;
use crate::error::{Error, Result};
use crate::message::WireMessage;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Read one wire message from the stream.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: PayloadCodec,
) -> Result<Option<WireMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len > MAX_FRAME_BYTES {
        return Err(Error::InvalidMessage);
    }

    let mut frame = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame).await?;

    codec.unmarshal(&frame).map(Some)
}

/// Write one wire message to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: PayloadCodec,
    msg: &WireMessage,
) -> Result<()> {
    let encoded = codec.marshal(msg)?;
    let len = u32::try_from(encoded.len()).map_err(|_| Error::InvalidMessage)?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::InvalidMessage);
    }

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
