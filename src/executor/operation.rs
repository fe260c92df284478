//! `OperationState`: a reusable record describing one backend operation.
//!
//! As spec.md §3's **OperationState** entity. Allocated from a pool (see
//! `block::pool::SimplePool`), filled in by the protocol layer, executed or
//! turned into a task by the backend, then returned to the pool with its
//! mutable fields cleared.

use uuid::Uuid;

use crate::block::DataBlock;

/// The operation kind the executor was asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationId {
    Alloc,
    SecureAlloc,
    SecureDiscard,
    AuthenticateClient,
    GetServerState,
    Get,
    Put,
    Command,
    Remove,
}

/// Secondary discriminant carried alongside `OperationId` for `Command`
/// operations; mirrors the wire command codes of C3/C4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandId {
    #[default]
    None,
    Remove,
    FlushPeerSessions,
}

/// A reusable, pool-backed operation descriptor. Never shared across
/// threads: ownership transfers into the executor on submit and back on
/// completion.
#[derive(Debug, Default)]
pub struct OperationState {
    pub operation_id: Option<OperationId>,
    pub command_id: CommandId,
    pub session_id: Option<Uuid>,
    pub chunk_id: Option<Uuid>,
    pub source_peer_id: Option<Uuid>,
    pub target_peer_id: Option<Uuid>,
    pub data: Option<DataBlock>,
}

impl OperationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every mutable field so the state is ready to be handed to the
    /// next caller by the pool. Breaks any back-pointer to a shared-state
    /// holder to avoid reference cycles, per spec.md §3's lifecycle note.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
