//! Relay Wire Protocol
//!
//! Length-and-checksum framed messages between overlay peers and a relay
//! node. Payloads are opaque to the relay; only the addressing envelope is
//! inspected.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::key::PublicKey;

/// Upper bound on a single relay frame; overlay messages are tiny, so
/// anything larger indicates a broken or hostile peer
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Relay protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame on a connection; announces the session key under which
    /// this client receives packets
    ClientHello { public_key: PublicKey },

    /// Relay's acknowledgement of a hello
    ServerHello { region_id: u16 },

    /// Forward `payload` to the client registered under `dst`
    SendPacket { dst: PublicKey, payload: Vec<u8> },

    /// A packet forwarded to us; `src` is the sender's session key
    RecvPacket { src: PublicKey, payload: Vec<u8> },

    /// Liveness probe
    Ping,

    /// Reply to a ping
    Pong,
}

impl RelayFrame {
    /// Get the frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            RelayFrame::ClientHello { .. } => "ClientHello",
            RelayFrame::ServerHello { .. } => "ServerHello",
            RelayFrame::SendPacket { .. } => "SendPacket",
            RelayFrame::RecvPacket { .. } => "RecvPacket",
            RelayFrame::Ping => "Ping",
            RelayFrame::Pong => "Pong",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// CRC32 of the message body
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header for `data`
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            checksum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RelayFrame> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(header.length as usize));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::FrameChecksum);
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &RelayFrame,
) -> Result<()> {
    let body = bincode::serialize(frame)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;

    #[tokio::test]
    async fn frame_roundtrip() {
        let frame = RelayFrame::SendPacket {
            dst: SecretKey::generate().public(),
            payload: vec![1, 2, 3, 4],
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        match decoded {
            RelayFrame::SendPacket { payload, .. } => assert_eq!(payload, vec![1, 2, 3, 4]),
            other => panic!("expected SendPacket, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn corrupted_body_fails_checksum() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &RelayFrame::Ping).await.unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::FrameChecksum)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let header = FrameHeader {
            length: (MAX_FRAME_LEN + 1) as u32,
            checksum: 0,
        };
        let mut cursor = std::io::Cursor::new(header.to_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::FrameTooLarge(_))
        ));
    }
}
