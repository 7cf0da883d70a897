//! Length-prefixed frame codec for the rendezvous link.
//!
//! Frame format:
//! ```text
//! ┌──────────────┬──────────────────┬───────────────────┐
//! │ type (1 byte)│ length (4 bytes) │ payload (N bytes) │
//! │              │   big-endian u32 │                   │
//! └──────────────┴──────────────────┴───────────────────┘
//! ```
//! One message per frame; reads reject frames larger than 1 MiB.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, RelayResult};

pub(crate) const FRAME_SERVER_KEY: u8 = 0x01;
pub(crate) const FRAME_CLIENT_INFO: u8 = 0x02;
pub(crate) const FRAME_SERVER_INFO: u8 = 0x03;
pub(crate) const FRAME_SEND_PACKET: u8 = 0x04;
pub(crate) const FRAME_RECV_PACKET: u8 = 0x05;
pub(crate) const FRAME_KEEP_ALIVE: u8 = 0x06;
pub(crate) const FRAME_PING: u8 = 0x12;
pub(crate) const FRAME_PONG: u8 = 0x13;

/// Maximum accepted frame payload (1 MiB).
pub(crate) const MAX_FRAME_SIZE: u32 = 1 << 20;

pub(crate) async fn write_frame_header<W>(writer: &mut W, typ: u8, len: u32) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[typ]).await?;
    writer.write_all(&len.to_be_bytes()).await?;
    Ok(())
}

/// Write a complete frame and flush the underlying writer.
pub(crate) async fn write_frame<W>(writer: &mut W, typ: u8, payload: &[u8]) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame_header(writer, typ, payload.len() as u32).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame_header<R>(reader: &mut R) -> RelayResult<(u8, u32)>
where
    R: AsyncRead + Unpin,
{
    let typ = reader.read_u8().await?;
    let len = reader.read_u32().await?;
    Ok((typ, len))
}

pub(crate) async fn read_frame_payload<R>(reader: &mut R, len: u32) -> RelayResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::Transport(format!("frame too large: {}", len)));
    }
    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(payload)
}
