//! `bl-messaging-broker`: a TLS-framed messaging broker, forwarding gateway,
//! and HTTP-to-messaging bridge.
//!
//! Module layout mirrors spec.md §4's component list: [`block`] (C1),
//! [`executor`] (C2), [`transport`] (C3), [`protocol`] (C4), [`authz`] (C5),
//! [`broker`] (C6), [`forwarding`] (C7), [`conversation`] (C8), [`bridge`]
//! (C9) and [`proxy`] (C10), wired together by [`server`]. [`config`],
//! [`error`] and [`logging`] are the ambient stack shared by both binaries.

pub mod authz;
pub mod block;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod conversation;
pub mod error;
pub mod executor;
pub mod forwarding;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod transport;

pub use authz::{AuthorizationCache, AuthorizationCacheConfig, RestAuthorizationCache, DEFAULT_FRESHNESS, DEFAULT_NEGATIVE_TTL};
pub use bridge::{router, BridgeHost, BridgeState};
pub use broker::{spawn_watchdog, Broker, OutgoingMessage, RoutingBackend, SessionState, Sessions, Targets, DEFAULT_QUEUE_DEPTH};
pub use config::{AuthorizationConfigFile, BridgeArgs, BrokerArgs, ExitCode};
pub use conversation::{run_conversation, ConversationOutcome, ConversationTable, RetryPolicy};
pub use error::{ErrorCode, ServerError, ServerErrorJson};
pub use executor::{Executor, OperationHandle};
pub use forwarding::{Backoff, ForwardingBackend, HostServices};
pub use protocol::{
    AsyncRpcResponse, AuthenticationToken, BrokerProtocol, ChunkId, CommandByte, ConnectionState,
    ConnectionStateMachine, ConversationId, MessageId, MessageType, Payload, PeerId, PrincipalIdentityInfo,
    SecurityPrincipal, HEADER_FIXED_LEN, MAX_HEADER_LEN, MAX_PAYLOAD_LEN,
};
pub use proxy::ProxyBroker;
pub use server::{run, BrokerServerConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_WATCHDOG_INTERVAL};
pub use transport::{
    client_connector, load_client_config, load_server_config, read_frame, server_acceptor, start_heartbeat,
    write_frame, BlockConnection, Frame, FrameHeader, IdleClock,
};
