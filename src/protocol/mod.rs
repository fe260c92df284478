//! Wire envelope and per-connection state machine (C4).

pub mod codes;
pub mod connection;
pub mod envelope;

pub use codes::{CommandByte, HEADER_FIXED_LEN, MAX_HEADER_LEN, MAX_PAYLOAD_LEN};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use envelope::{
    AsyncRpcResponse, AuthenticationToken, BrokerProtocol, ChunkId, ConversationId, MessageId,
    MessageType, Payload, PeerId, PrincipalIdentityInfo, SecurityPrincipal,
};
