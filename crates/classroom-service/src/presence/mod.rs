//! Presence store: room membership and connection bindings.
//!
//! Two record types are kept:
//!
//! - Room membership: `room -> set of participant ids`
//! - Connection bindings: `connection -> {room, participant, display name}`
//!
//! A participant may be bound through several connections (one per tab). The
//! store keeps a per-participant session count so that membership is only
//! dropped, and attendance only recorded, on the first and last session.
//!
//! All operations are atomic with respect to concurrent callers, including
//! callers in other processes when the Redis backend is used. An unreachable
//! store surfaces as [`CsError::StoreUnavailable`]; membership is never
//! silently dropped.
//!
//! # Session leases
//!
//! Attendance transitions ("joined" on the first session, "left" on the last)
//! span a store update and a backend call. A [`SessionLease`] taken from the
//! store serializes them per room and participant across every node sharing
//! the store. Leases expire on their own, and each grant carries a generation
//! that increases monotonically, so a holder whose lease lapsed cannot release
//! its successor's.

mod lua_scripts;
mod memory;
mod redis_store;

pub use self::memory::InMemoryPresenceStore;
pub use self::redis_store::RedisPresenceStore;

use crate::errors::CsError;
use async_trait::async_trait;
use common::types::{ConnectionId, ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity attached to a connection once it has joined a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub room: RoomId,
    pub participant: ParticipantId,
    pub display_name: String,
}

impl Binding {
    #[must_use]
    pub fn new(room: RoomId, participant: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            room,
            participant,
            display_name: display_name.into(),
        }
    }
}

/// Result of [`PresenceStore::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Connection is now bound. `first_session` is true when the participant
    /// had no other bound connection in the room.
    Attached { first_session: bool },
    /// The connection already carries this exact room and participant.
    AlreadyBound,
    /// The connection is bound to a different room or participant.
    BoundElsewhere,
}

/// Result of [`PresenceStore::detach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachOutcome {
    /// The binding that was removed.
    pub binding: Binding,
    /// True when this was the participant's last session in the room, in
    /// which case the participant was also removed from the member set.
    pub last_session: bool,
}

/// Exclusive right to change one participant's attendance state in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub room: RoomId,
    pub participant: ParticipantId,
    /// Fencing generation, strictly increasing per room and participant.
    pub generation: u64,
}

/// Shared store of room membership and connection bindings.
///
/// The primitive operations (`add_member` .. `unbind_connection`) each touch a
/// single record. The session gateway uses the composite `attach`/`detach`
/// operations, which update binding, membership and the session count in one
/// atomic step.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add a participant to a room's member set.
    async fn add_member(&self, room: &RoomId, participant: &ParticipantId) -> Result<(), CsError>;

    /// Remove a participant from a room's member set.
    async fn remove_member(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), CsError>;

    /// List a room's members, sorted by participant id.
    async fn list_members(&self, room: &RoomId) -> Result<Vec<ParticipantId>, CsError>;

    /// Bind a connection to a room identity, replacing any previous binding.
    async fn bind_connection(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<(), CsError>;

    /// Look up the binding of a connection.
    async fn lookup_connection(&self, connection: ConnectionId)
        -> Result<Option<Binding>, CsError>;

    /// Remove a connection's binding, returning it if one existed.
    async fn unbind_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError>;

    /// Atomically bind a connection, add its participant to the room and
    /// count the session.
    async fn attach(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<AttachOutcome, CsError>;

    /// Atomically unbind a connection and drop its session. Removes the
    /// participant from the room when no sessions remain. Returns `None` when
    /// the connection had no binding.
    async fn detach(&self, connection: ConnectionId) -> Result<Option<DetachOutcome>, CsError>;

    /// Number of bound sessions a participant holds in a room.
    async fn session_count(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<u64, CsError>;

    /// Take the participant's session lease for `ttl`. Returns `None` while
    /// another holder's lease is live.
    async fn try_acquire_lease(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        ttl: Duration,
    ) -> Result<Option<SessionLease>, CsError>;

    /// Release a lease. Returns `false` if it had already expired or been
    /// granted to someone else.
    async fn release_lease(&self, lease: &SessionLease) -> Result<bool, CsError>;
}
