//! Proxy broker backend (C10): the `RoutingBackend` variant that forwards
//! to another broker instead of delivering locally.
//!
//! As spec.md §4.C10: swaps `Broker`'s "deliver to local session" for "push
//! to an upstream broker via C7's `ForwardingBackend`". Routing validation
//! and backpressure rules are identical to `broker::Broker`; only the
//! terminal dispatch changes, which is exactly the seam `RoutingBackend`
//! exists for. Used to build broker farms / aggregation tiers, selected at
//! startup by `--proxy-endpoints`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{RoutingBackend, Sessions};
use crate::error::ServerError;
use crate::forwarding::{ForwardingBackend, HostServices};
use crate::protocol::{BrokerProtocol, MessageType, PeerId};
use crate::transport::FrameHeader;

/// Forwards every routable envelope to an upstream broker via a
/// `ForwardingBackend` instead of resolving it against a locally-owned
/// target table. `BackendAssociateTargetPeerId`/`Dissociate` are forwarded
/// too, so the upstream broker's own target table stays authoritative —
/// this tier does no routing decisions of its own.
///
/// Replies and notifications the upstream broker sends back down this
/// connection are routed into this tier's own `Sessions` table — the same
/// delivery path `broker::Broker` uses for local dispatch — via the
/// `HostServices` hook installed on `upstream`. That is what lets a proxy
/// tier aggregate several downstream peers behind one upstream connection.
pub struct ProxyBroker {
    upstream: Arc<ForwardingBackend>,
    downstream_sessions: Arc<Sessions>,
}

impl ProxyBroker {
    pub fn new(upstream: Arc<ForwardingBackend>, downstream_sessions: Arc<Sessions>) -> Self {
        Self {
            upstream,
            downstream_sessions,
        }
    }
}

impl HostServices for ProxyBroker {
    /// An inbound frame from the upstream broker is a reply or
    /// notification addressed to one of this tier's own downstream peers;
    /// `header.target_peer_id` names which one. Unroutable frames (no
    /// matching downstream session, e.g. it already disconnected) are
    /// dropped rather than raising an alarm, matching spec.md §4.C6's
    /// "expected client errors do not stop the broker" posture.
    fn on_incoming(&self, header: FrameHeader, payload: Vec<u8>) {
        let sessions = self.downstream_sessions.clone();
        tokio::spawn(async move {
            if let Err(err) = sessions.push(&header.target_peer_id, (header, payload)).await {
                log::debug!("[proxy] dropping unroutable upstream reply: {err}");
            }
        });
    }
}

#[async_trait]
impl RoutingBackend for ProxyBroker {
    async fn dispatch(
        &self,
        sender: PeerId,
        envelope: &BrokerProtocol,
        header: FrameHeader,
        payload: Vec<u8>,
    ) -> Result<(), ServerError> {
        if let Some(claimed) = envelope.source_peer_id {
            if claimed != sender {
                return Err(ServerError::AuthorizationFailed(
                    "sourcePeerId does not match the authenticated peer".into(),
                ));
            }
        }

        let target = match envelope.message_type {
            MessageType::BackendAssociateTargetPeerId | MessageType::BackendDissociateTargetPeerId => {
                envelope.target_peer_id.ok_or_else(|| {
                    ServerError::ProtocolValidationFailed("associate/dissociate missing targetPeerId".into())
                })?
            }
            MessageType::AsyncRpcDispatch | MessageType::AsyncNotification | MessageType::AsyncRpcAcknowledgment => {
                envelope
                    .target_peer_id
                    .ok_or_else(|| ServerError::ProtocolValidationFailed("dispatch missing targetPeerId".into()))?
            }
        };

        self.upstream.push(target, header, payload).await
    }
}
