//! Target association table: `targetPeerId -> peerId`.
//!
//! A directed edge the broker consults on every routed `AsyncRpcDispatch`/
//! `AsyncNotification`; when no entry exists, the target is unreachable
//! (spec.md §3). One `RwLock<HashMap<..>>`, matching the broker's locking
//! discipline.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::protocol::PeerId;

#[derive(Default)]
pub struct Targets {
    inner: RwLock<HashMap<PeerId, PeerId>>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate(&self, target_peer_id: PeerId, owner_peer_id: PeerId) {
        self.inner
            .write()
            .expect("targets lock poisoned")
            .insert(target_peer_id, owner_peer_id);
    }

    pub fn dissociate(&self, target_peer_id: &PeerId) {
        self.inner.write().expect("targets lock poisoned").remove(target_peer_id);
    }

    pub fn resolve(&self, target_peer_id: &PeerId) -> Option<PeerId> {
        self.inner
            .read()
            .expect("targets lock poisoned")
            .get(target_peer_id)
            .copied()
    }

    /// Drops every association pointing at `owner_peer_id`, the cleanup a
    /// disconnecting session needs to perform so stale routes don't
    /// outlive it.
    pub fn remove_owned_by(&self, owner_peer_id: &PeerId) {
        self.inner
            .write()
            .expect("targets lock poisoned")
            .retain(|_, owner| owner != owner_peer_id);
    }
}
