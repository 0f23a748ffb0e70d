//! Wire format for the live view connection
//!
//! Server to client: repeated packets, each a 4-byte little-endian length
//! followed by that many bytes. Frame packets carry one whole JPEG; the
//! snapshot acknowledgment is a single-byte packet (`'S'` or `'F'`).
//!
//! Client to server: 2-byte command messages. `[0x01, 0x01]` requests an
//! out-of-band high-res snapshot; anything else is a protocol violation and
//! the connection is closed.

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Command message size in bytes
pub const CMD_LEN: usize = 2;

/// Snapshot request command
pub const CMD_SNAPSHOT: [u8; CMD_LEN] = [0x01, 0x01];

/// Snapshot succeeded; artifact queued for upload
pub const ACK_SUCCESS: u8 = b'S';

/// Snapshot failed; see device logs
pub const ACK_FAILURE: u8 = b'F';

/// Upper bound on a single packet (a full-res JPEG is well under this)
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// Write one length-prefixed packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    anyhow::ensure!(
        payload.len() <= MAX_PACKET_LEN,
        "packet too large: {} > {}",
        payload.len(),
        MAX_PACKET_LEN
    );
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Read one length-prefixed packet. Client-side counterpart of
/// [`write_packet`]; the server itself never reads packets, only commands.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    anyhow::ensure!(len <= MAX_PACKET_LEN, "packet length exceeds maximum: {len}");

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read one client command. Returns `None` on clean disconnect.
pub async fn read_command<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<[u8; CMD_LEN]>> {
    let mut cmd = [0u8; CMD_LEN];
    match reader.read_exact(&mut cmd).await {
        Ok(_) => Ok(Some(cmd)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
