//! Wire-level command codes and frame size limits.
//!
//! As spec.md §6: the header's first byte is a command id. `0 = ReceiveChunk`,
//! `1 = SendChunk`, `2 = FlushPeerSessions`, all other values reserved.
//! Heartbeats reuse `ReceiveChunk` with a nil chunk id (spec.md §4.C3).

use crate::error::ServerError;

/// Header size ceiling: 64 KiB.
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Payload size ceiling: 1 MiB.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

/// Fixed header layout: `u8 commandId | 16B chunkId | 16B sourcePeerId |
/// 16B targetPeerId | reserved`.
pub const HEADER_FIXED_LEN: usize = 1 + 16 + 16 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandByte {
    ReceiveChunk = 0,
    SendChunk = 1,
    FlushPeerSessions = 2,
}

impl CommandByte {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Result<Self, ServerError> {
        match byte {
            0 => Ok(Self::ReceiveChunk),
            1 => Ok(Self::SendChunk),
            2 => Ok(Self::FlushPeerSessions),
            other => Err(ServerError::ProtocolValidationFailed(format!(
                "unknown command byte {other}"
            ))),
        }
    }
}
