//! TLS block transport (C3).

pub mod framing;
pub mod heartbeat;
pub mod tls;

pub use framing::{read_frame, write_frame, Frame, FrameHeader};
pub use heartbeat::{start_heartbeat, IdleClock};
pub use tls::{client_connector, load_client_config, load_server_config, server_acceptor, BlockConnection};
