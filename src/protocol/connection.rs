//! Per-connection protocol state machine (C4).
//!
//! As spec.md §4.C4: `Connecting -> Authenticating -> Ready -> Draining ->
//! Closed`, a small closed set of states driven by an explicit struct
//! rather than a trait-object-per-state (REDESIGN FLAGS: collapse CRTP
//! template bases to concrete types when the state set is small and
//! closed).

use uuid::Uuid;

use crate::error::ServerError;
use crate::protocol::envelope::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

/// Drives one connection's lifecycle. Owned by the per-connection read-loop
/// task; the peer id is only known once `Ready`.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    peer_id: Option<PeerId>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            peer_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    /// TLS handshake complete.
    pub fn on_handshake_complete(&mut self) -> Result<(), ServerError> {
        self.require(ConnectionState::Connecting)?;
        self.state = ConnectionState::Authenticating;
        Ok(())
    }

    /// Authorization cache returned a valid principal; the peer's session is
    /// registered with the broker under `peer_id`.
    pub fn on_authenticated(&mut self, peer_id: Uuid) -> Result<(), ServerError> {
        self.require(ConnectionState::Authenticating)?;
        self.peer_id = Some(peer_id);
        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// `FlushPeerSessions` from the peer, or a controller-initiated cancel:
    /// no new frames accepted, in-flight allowed to complete.
    pub fn on_drain_requested(&mut self) -> Result<(), ServerError> {
        if self.state == ConnectionState::Draining || self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.require(ConnectionState::Ready)?;
        self.state = ConnectionState::Draining;
        Ok(())
    }

    /// I/O error, unrecoverable protocol violation, or completion of
    /// draining. Idempotent: closing an already-closed connection is a
    /// no-op.
    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Whether a new inbound frame may be processed in the current state.
    pub fn accepts_frames(&self) -> bool {
        matches!(self.state, ConnectionState::Ready)
    }

    fn require(&self, expected: ConnectionState) -> Result<(), ServerError> {
        if self.state != expected {
            return Err(ServerError::ProtocolValidationFailed(format!(
                "connection not in expected state {expected:?} (actual {:?})",
                self.state
            )));
        }
        Ok(())
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
