//! Peer session registry.
//!
//! `sessions: peerId -> SessionState`, populated at authentication. Grounded
//! in the teacher's `hub/mod.rs` central hub owning a map of live
//! connections, generalized from a single PTY-client-map to a
//! broker-wide peer registry guarded by one `RwLock` (spec.md §5: writers
//! rare, readers frequent).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::protocol::{PeerId, SecurityPrincipal};
use crate::transport::FrameHeader;

/// One outbound message queued for delivery to a session.
pub type OutgoingMessage = (FrameHeader, Vec<u8>);

/// Created on successful authentication; destroyed on disconnect or an
/// explicit `FlushPeerSessions`.
pub struct SessionState {
    pub peer_id: PeerId,
    pub principal: SecurityPrincipal,
    pub outgoing: mpsc::Sender<OutgoingMessage>,
    pub last_activity: RwLock<Instant>,
    pub created_at: Instant,
}

impl SessionState {
    pub fn new(peer_id: PeerId, principal: SecurityPrincipal, outgoing: mpsc::Sender<OutgoingMessage>) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            principal,
            outgoing,
            last_activity: RwLock::new(now),
            created_at: now,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write().expect("session lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().expect("session lock poisoned").elapsed()
    }
}

/// The peer session registry. One `RwLock<HashMap<..>>`, matching the
/// locking discipline spec.md §5 calls for.
#[derive(Default)]
pub struct Sessions {
    inner: RwLock<HashMap<PeerId, std::sync::Arc<SessionState>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invariant 1: exactly one session per active peerId. Registering a
    /// second session for the same peer id replaces the first.
    pub fn register(&self, session: SessionState) -> std::sync::Arc<SessionState> {
        let session = std::sync::Arc::new(session);
        self.inner
            .write()
            .expect("sessions lock poisoned")
            .insert(session.peer_id, session.clone());
        session
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<std::sync::Arc<SessionState>> {
        self.inner.read().expect("sessions lock poisoned").get(peer_id).cloned()
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<std::sync::Arc<SessionState>> {
        self.inner.write().expect("sessions lock poisoned").remove(peer_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("sessions lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues a message on `peer_id`'s outgoing channel; fails with
    /// `TargetPeerQueueFull` if the bounded channel is saturated, or
    /// `TargetPeerNotFound` if the peer has no session.
    pub async fn push(&self, peer_id: &PeerId, message: OutgoingMessage) -> Result<(), ServerError> {
        let session = self
            .get(peer_id)
            .ok_or_else(|| ServerError::TargetPeerNotFound {
                target: peer_id.to_string(),
            })?;

        session.outgoing.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ServerError::TargetPeerQueueFull {
                target: peer_id.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => ServerError::TargetPeerNotFound {
                target: peer_id.to_string(),
            },
        })?;

        session.touch();
        Ok(())
    }

    /// Sessions whose idle time exceeds `threshold`, for watchdog eviction.
    pub fn stale_peers(&self, threshold: std::time::Duration) -> Vec<PeerId> {
        self.inner
            .read()
            .expect("sessions lock poisoned")
            .values()
            .filter(|s| s.idle_for() > threshold)
            .map(|s| s.peer_id)
            .collect()
    }
}
