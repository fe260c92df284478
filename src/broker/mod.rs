//! Broker routing engine (C6) and the `RoutingBackend` seam C10 swaps out.

pub mod sessions;
pub mod targets;
pub mod watchdog;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServerError;
use crate::protocol::{BrokerProtocol, MessageType, PeerId};
use crate::transport::FrameHeader;

pub use sessions::{OutgoingMessage, SessionState, Sessions};
pub use targets::Targets;
pub use watchdog::spawn_watchdog;

/// Default per-session outgoing queue depth. Resolves spec.md §9's open
/// question; overridable via `--max-queue-depth`.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// The seam C10 swaps: `LocalBroker` (this module) delivers to a session it
/// owns directly; `proxy::ProxyBroker` forwards to an upstream broker
/// instead. Routing and backpressure rules are identical between the two —
/// only the terminal dispatch changes.
#[async_trait]
pub trait RoutingBackend: Send + Sync {
    /// Routes one already-validated envelope + raw frame bytes. Expected
    /// failures (auth, queue-full, target-not-found) are returned as
    /// `Err(ServerError)` for the caller to fold into an
    /// `AsyncRpcAcknowledgment`; they never stop the broker.
    async fn dispatch(
        &self,
        sender: PeerId,
        envelope: &BrokerProtocol,
        header: FrameHeader,
        payload: Vec<u8>,
    ) -> Result<(), ServerError>;
}

/// The local broker: owns the peer registry and the target association
/// table, and delivers directly into a session's outgoing channel.
/// Grounded in the teacher's `hub/mod.rs` (central hub owning maps of live
/// connections).
pub struct Broker {
    pub sessions: Arc<Sessions>,
    pub targets: Arc<Targets>,
    /// Whether an unexpected internal backend error should stop the whole
    /// server. spec.md §4.C6 defaults this to `false`: one connection dies,
    /// the broker keeps running.
    pub stop_server_on_unexpected_backend_error: bool,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Sessions::new()),
            targets: Arc::new(Targets::new()),
            stop_server_on_unexpected_backend_error: false,
        }
    }

    /// Steps 1-4 of spec.md §4.C6's routing algorithm. `sender` is the
    /// already-authenticated peer id of the connection the frame arrived
    /// on; validating it against `envelope.source_peer_id` is invariant 2.
    fn validate(&self, sender: PeerId, envelope: &BrokerProtocol) -> Result<(), ServerError> {
        match envelope.source_peer_id {
            Some(claimed) if claimed == sender => Ok(()),
            Some(_) => Err(ServerError::AuthorizationFailed(
                "sourcePeerId does not match the authenticated peer".into(),
            )),
            None => Ok(()),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingBackend for Broker {
    async fn dispatch(
        &self,
        sender: PeerId,
        envelope: &BrokerProtocol,
        header: FrameHeader,
        payload: Vec<u8>,
    ) -> Result<(), ServerError> {
        self.validate(sender, envelope)?;

        match envelope.message_type {
            MessageType::BackendAssociateTargetPeerId => {
                let target = envelope.target_peer_id.ok_or_else(|| {
                    ServerError::ProtocolValidationFailed("BackendAssociateTargetPeerId missing targetPeerId".into())
                })?;
                self.targets.associate(target, sender);
                Ok(())
            }
            MessageType::BackendDissociateTargetPeerId => {
                let target = envelope.target_peer_id.ok_or_else(|| {
                    ServerError::ProtocolValidationFailed("BackendDissociateTargetPeerId missing targetPeerId".into())
                })?;
                self.targets.dissociate(&target);
                Ok(())
            }
            MessageType::AsyncRpcDispatch | MessageType::AsyncNotification | MessageType::AsyncRpcAcknowledgment => {
                let target = envelope.target_peer_id.ok_or_else(|| {
                    ServerError::ProtocolValidationFailed("dispatch/notification missing targetPeerId".into())
                })?;
                let recipient = self.targets.resolve(&target).ok_or(ServerError::TargetPeerNotFound {
                    target: target.to_string(),
                })?;
                self.sessions.push(&recipient, (header, payload)).await?;
                if let Some(session) = self.sessions.get(&sender) {
                    session.touch();
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{codes::CommandByte, SecurityPrincipal};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn principal() -> SecurityPrincipal {
        SecurityPrincipal {
            sid: "p".into(),
            given_name: None,
            family_name: None,
            email: None,
            type_id: None,
        }
    }

    #[tokio::test]
    async fn loopback_dispatch_delivers_to_associated_target() {
        let broker = Broker::new();
        let a = PeerId::new_v4();
        let b = PeerId::new_v4();
        let target = PeerId::new_v4();

        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        broker.sessions.register(SessionState::new(a, principal(), tx_a));
        broker.sessions.register(SessionState::new(b, principal(), tx_b));
        broker.targets.associate(target, b);

        let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
        envelope.source_peer_id = Some(a);
        envelope.target_peer_id = Some(target);

        let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), a, target);
        broker
            .dispatch(a, &envelope, header, b"hello".to_vec())
            .await
            .unwrap();

        let (received_header, received_payload) = rx_b.recv().await.unwrap();
        assert_eq!(received_header.source_peer_id, a);
        assert_eq!(received_payload, b"hello");
    }

    #[tokio::test]
    async fn dispatch_to_unassociated_target_fails_not_found() {
        let broker = Broker::new();
        let a = PeerId::new_v4();
        let (tx_a, _rx_a) = mpsc::channel(4);
        broker.sessions.register(SessionState::new(a, principal(), tx_a));

        let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
        envelope.source_peer_id = Some(a);
        envelope.target_peer_id = Some(PeerId::new_v4());

        let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), a, PeerId::new_v4());
        let err = broker.dispatch(a, &envelope, header, vec![]).await.unwrap_err();
        assert!(matches!(err, ServerError::TargetPeerNotFound { .. }));
    }

    #[tokio::test]
    async fn spoofed_source_peer_id_is_rejected() {
        let broker = Broker::new();
        let a = PeerId::new_v4();

        let mut envelope = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
        envelope.source_peer_id = Some(PeerId::new_v4());
        envelope.target_peer_id = Some(PeerId::new_v4());

        let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), a, PeerId::new_v4());
        let err = broker.dispatch(a, &envelope, header, vec![]).await.unwrap_err();
        assert!(matches!(err, ServerError::AuthorizationFailed(_)));
    }

    #[tokio::test]
    async fn associate_then_dissociate_removes_routing() {
        let broker = Broker::new();
        let owner = PeerId::new_v4();
        let target = PeerId::new_v4();

        let mut associate = BrokerProtocol::new(MessageType::BackendAssociateTargetPeerId, Uuid::new_v4());
        associate.source_peer_id = Some(owner);
        associate.target_peer_id = Some(target);
        let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), owner, target);
        broker.dispatch(owner, &associate, header, vec![]).await.unwrap();
        assert_eq!(broker.targets.resolve(&target), Some(owner));

        let mut dissociate = BrokerProtocol::new(MessageType::BackendDissociateTargetPeerId, Uuid::new_v4());
        dissociate.source_peer_id = Some(owner);
        dissociate.target_peer_id = Some(target);
        broker.dispatch(owner, &dissociate, header, vec![]).await.unwrap();
        assert!(broker.targets.resolve(&target).is_none());
    }
}
