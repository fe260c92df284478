//! Length-prefixed frame header/body, and the async read/write helpers (C3).
//!
//! Wire format (spec.md §6): `u32_be headerLen | header | u32_be payloadLen
//! | payload`, where the header is `u8 commandId | 16B chunkId | 16B
//! sourcePeerId | 16B targetPeerId | reserved`. Numbers on the wire are
//! big-endian. Grounded in the teacher's `broker::protocol` incremental
//! frame decoder shape (`BrokerFrameDecoder::feed`), adapted here to the
//! spec's big-endian, no-type-byte-in-the-length layout and to
//! `tokio::io::{AsyncRead, AsyncWrite}` instead of a manual byte-accumulator.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::ServerError;
use crate::protocol::codes::{CommandByte, HEADER_FIXED_LEN, MAX_HEADER_LEN, MAX_PAYLOAD_LEN};

/// The decoded fixed-size header of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: CommandByte,
    pub chunk_id: Uuid,
    pub source_peer_id: Uuid,
    pub target_peer_id: Uuid,
}

impl FrameHeader {
    pub fn new(command: CommandByte, chunk_id: Uuid, source_peer_id: Uuid, target_peer_id: Uuid) -> Self {
        Self {
            command,
            chunk_id,
            source_peer_id,
            target_peer_id,
        }
    }

    /// A `ReceiveChunk` header with a nil chunk id, the convention for
    /// heartbeats (spec.md §4.C3).
    pub fn heartbeat(source_peer_id: Uuid, target_peer_id: Uuid) -> Self {
        Self::new(CommandByte::ReceiveChunk, Uuid::nil(), source_peer_id, target_peer_id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_FIXED_LEN);
        buf.push(self.command.to_u8());
        buf.extend_from_slice(self.chunk_id.as_bytes());
        buf.extend_from_slice(self.source_peer_id.as_bytes());
        buf.extend_from_slice(self.target_peer_id.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ServerError> {
        if bytes.len() < HEADER_FIXED_LEN {
            return Err(ServerError::ProtocolValidationFailed(format!(
                "header too short: need {HEADER_FIXED_LEN} bytes, have {}",
                bytes.len()
            )));
        }
        let command = CommandByte::from_u8(bytes[0])?;
        let chunk_id = Uuid::from_slice(&bytes[1..17])
            .map_err(|e| ServerError::ProtocolValidationFailed(format!("bad chunk id: {e}")))?;
        let source_peer_id = Uuid::from_slice(&bytes[17..33])
            .map_err(|e| ServerError::ProtocolValidationFailed(format!("bad source peer id: {e}")))?;
        let target_peer_id = Uuid::from_slice(&bytes[33..49])
            .map_err(|e| ServerError::ProtocolValidationFailed(format!("bad target peer id: {e}")))?;

        Ok(Self {
            command,
            chunk_id,
            source_peer_id,
            target_peer_id,
        })
    }
}

/// A fully decoded frame: header plus raw JSON payload bytes (empty is
/// valid — a zero-length payload is a legal frame per spec.md §4.C3).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Reads one complete frame from `stream`. Fails with
/// `ProtocolValidationFailed` on malformed sizes (exceeding the header/
/// payload ceilings) and with a connection-error-classified `ServerError`
/// on premature EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame, ServerError> {
    let header_len = stream.read_u32().await?;
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(ServerError::ProtocolValidationFailed(format!(
            "header length {header_len} outside allowed range (1..={MAX_HEADER_LEN})"
        )));
    }

    let mut header_bytes = vec![0u8; header_len as usize];
    stream.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(&header_bytes)?;

    let payload_len = stream.read_u32().await?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ServerError::ProtocolValidationFailed(format!(
            "payload length {payload_len} exceeds {MAX_PAYLOAD_LEN}"
        )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    stream.read_exact(&mut payload).await?;

    Ok(Frame { header, payload })
}

/// Writes one complete frame to `stream`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    header: &FrameHeader,
    payload: &[u8],
) -> Result<(), ServerError> {
    if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
        return Err(ServerError::ProtocolValidationFailed(format!(
            "payload length {} exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        )));
    }

    let header_bytes = header.encode();
    stream.write_u32(header_bytes.len() as u32).await?;
    stream.write_all(&header_bytes).await?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
