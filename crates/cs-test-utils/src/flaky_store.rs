//! Presence store with failure injection.
//!
//! Delegates to [`InMemoryPresenceStore`] and fails selected operations with
//! `StoreUnavailable`, the way an unreachable Redis would.

use async_trait::async_trait;
use classroom_service::errors::CsError;
use classroom_service::presence::{
    AttachOutcome, Binding, DetachOutcome, InMemoryPresenceStore, PresenceStore, SessionLease,
};
use common::types::{ConnectionId, ParticipantId, RoomId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FlakyPresenceStore {
    inner: InMemoryPresenceStore,
    unavailable: AtomicBool,
    fail_list_members: AtomicBool,
}

impl FlakyPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only `list_members`.
    pub fn set_list_members_failure(&self, fail: bool) {
        self.fail_list_members.store(fail, Ordering::SeqCst);
    }

    /// The wrapped store, for assertions that bypass failure injection.
    pub fn inner(&self) -> &InMemoryPresenceStore {
        &self.inner
    }

    fn check(&self) -> Result<(), CsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CsError::StoreUnavailable(
                "injected presence store outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for FlakyPresenceStore {
    async fn add_member(&self, room: &RoomId, participant: &ParticipantId) -> Result<(), CsError> {
        self.check()?;
        self.inner.add_member(room, participant).await
    }

    async fn remove_member(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), CsError> {
        self.check()?;
        self.inner.remove_member(room, participant).await
    }

    async fn list_members(&self, room: &RoomId) -> Result<Vec<ParticipantId>, CsError> {
        self.check()?;
        if self.fail_list_members.load(Ordering::SeqCst) {
            return Err(CsError::StoreUnavailable(
                "injected list_members failure".to_string(),
            ));
        }
        self.inner.list_members(room).await
    }

    async fn bind_connection(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<(), CsError> {
        self.check()?;
        self.inner.bind_connection(connection, binding).await
    }

    async fn lookup_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError> {
        self.check()?;
        self.inner.lookup_connection(connection).await
    }

    async fn unbind_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError> {
        self.check()?;
        self.inner.unbind_connection(connection).await
    }

    async fn attach(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<AttachOutcome, CsError> {
        self.check()?;
        self.inner.attach(connection, binding).await
    }

    async fn detach(&self, connection: ConnectionId) -> Result<Option<DetachOutcome>, CsError> {
        self.check()?;
        self.inner.detach(connection).await
    }

    async fn session_count(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<u64, CsError> {
        self.check()?;
        self.inner.session_count(room, participant).await
    }

    async fn try_acquire_lease(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        ttl: Duration,
    ) -> Result<Option<SessionLease>, CsError> {
        self.check()?;
        self.inner.try_acquire_lease(room, participant, ttl).await
    }

    // Releases bypass failure injection
    async fn release_lease(&self, lease: &SessionLease) -> Result<bool, CsError> {
        self.inner.release_lease(lease).await
    }
}
