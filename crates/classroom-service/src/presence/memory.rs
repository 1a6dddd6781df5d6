//! Process-local presence store.
//!
//! Used for single-node deployments (`CS_COORDINATION_BACKEND=memory`) and
//! tests. One mutex guards every map so each operation is atomic; the
//! lock is never held across an await.

use super::{AttachOutcome, Binding, DetachOutcome, PresenceStore, SessionLease};
use crate::errors::CsError;
use async_trait::async_trait;
use common::types::{ConnectionId, ParticipantId, RoomId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

type SessionKey = (RoomId, ParticipantId);

#[derive(Debug, Clone, Copy)]
struct HeldLease {
    generation: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    members: HashMap<RoomId, BTreeSet<ParticipantId>>,
    sessions: HashMap<SessionKey, u64>,
    bindings: HashMap<ConnectionId, Binding>,
    leases: HashMap<SessionKey, HeldLease>,
    lease_generations: HashMap<SessionKey, u64>,
}

/// In-memory [`PresenceStore`].
#[derive(Debug, Default)]
pub struct InMemoryPresenceStore {
    inner: Mutex<Inner>,
}

impl InMemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn remove_member(&mut self, room: &RoomId, participant: &ParticipantId) {
        if let Some(set) = self.members.get_mut(room) {
            set.remove(participant);
            if set.is_empty() {
                self.members.remove(room);
            }
        }
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn add_member(&self, room: &RoomId, participant: &ParticipantId) -> Result<(), CsError> {
        self.lock()
            .members
            .entry(room.clone())
            .or_default()
            .insert(participant.clone());
        Ok(())
    }

    async fn remove_member(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), CsError> {
        self.lock().remove_member(room, participant);
        Ok(())
    }

    async fn list_members(&self, room: &RoomId) -> Result<Vec<ParticipantId>, CsError> {
        Ok(self
            .lock()
            .members
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn bind_connection(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<(), CsError> {
        self.lock().bindings.insert(connection, binding.clone());
        Ok(())
    }

    async fn lookup_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError> {
        Ok(self.lock().bindings.get(&connection).cloned())
    }

    async fn unbind_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError> {
        Ok(self.lock().bindings.remove(&connection))
    }

    async fn attach(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<AttachOutcome, CsError> {
        let mut inner = self.lock();

        if let Some(existing) = inner.bindings.get(&connection) {
            if existing.room == binding.room && existing.participant == binding.participant {
                return Ok(AttachOutcome::AlreadyBound);
            }
            return Ok(AttachOutcome::BoundElsewhere);
        }

        inner.bindings.insert(connection, binding.clone());
        inner
            .members
            .entry(binding.room.clone())
            .or_default()
            .insert(binding.participant.clone());
        let count = inner
            .sessions
            .entry((binding.room.clone(), binding.participant.clone()))
            .or_insert(0);
        *count += 1;

        Ok(AttachOutcome::Attached {
            first_session: *count == 1,
        })
    }

    async fn detach(&self, connection: ConnectionId) -> Result<Option<DetachOutcome>, CsError> {
        let mut inner = self.lock();

        let Some(binding) = inner.bindings.remove(&connection) else {
            return Ok(None);
        };

        let key = (binding.room.clone(), binding.participant.clone());
        let remaining = match inner.sessions.get_mut(&key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };

        let last_session = remaining == 0;
        if last_session {
            inner.sessions.remove(&key);
            inner.remove_member(&binding.room, &binding.participant);
        }

        Ok(Some(DetachOutcome {
            binding,
            last_session,
        }))
    }

    async fn session_count(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<u64, CsError> {
        Ok(self
            .lock()
            .sessions
            .get(&(room.clone(), participant.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn try_acquire_lease(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        ttl: Duration,
    ) -> Result<Option<SessionLease>, CsError> {
        let mut inner = self.lock();
        let key = (room.clone(), participant.clone());
        let now = Instant::now();

        if inner
            .leases
            .get(&key)
            .is_some_and(|held| held.expires_at > now)
        {
            return Ok(None);
        }

        let generation = {
            let counter = inner.lease_generations.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        inner.leases.insert(
            key,
            HeldLease {
                generation,
                expires_at: now + ttl,
            },
        );

        Ok(Some(SessionLease {
            room: room.clone(),
            participant: participant.clone(),
            generation,
        }))
    }

    async fn release_lease(&self, lease: &SessionLease) -> Result<bool, CsError> {
        let mut inner = self.lock();
        let key = (lease.room.clone(), lease.participant.clone());
        let now = Instant::now();

        match inner.leases.get(&key).copied() {
            Some(held) if held.generation == lease.generation => {
                inner.leases.remove(&key);
                Ok(held.expires_at > now)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn binding(room: &str, participant: &str) -> Binding {
        Binding::new(RoomId::from(room), ParticipantId::from(participant), participant)
    }

    #[tokio::test]
    async fn test_primitive_operations() {
        let store = InMemoryPresenceStore::new();
        let room = RoomId::from("r1");
        let conn = ConnectionId::new();

        store.add_member(&room, &ParticipantId::from("b")).await.unwrap();
        store.add_member(&room, &ParticipantId::from("a")).await.unwrap();
        store.add_member(&room, &ParticipantId::from("a")).await.unwrap();
        assert_eq!(
            store.list_members(&room).await.unwrap(),
            vec![ParticipantId::from("a"), ParticipantId::from("b")]
        );

        store.bind_connection(conn, &binding("r1", "a")).await.unwrap();
        assert_eq!(
            store.lookup_connection(conn).await.unwrap(),
            Some(binding("r1", "a"))
        );
        assert_eq!(
            store.unbind_connection(conn).await.unwrap(),
            Some(binding("r1", "a"))
        );
        assert_eq!(store.lookup_connection(conn).await.unwrap(), None);

        store.remove_member(&room, &ParticipantId::from("a")).await.unwrap();
        store.remove_member(&room, &ParticipantId::from("b")).await.unwrap();
        assert!(store.list_members(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_tracks_first_session() {
        let store = InMemoryPresenceStore::new();
        let tab1 = ConnectionId::new();
        let tab2 = ConnectionId::new();

        assert_eq!(
            store.attach(tab1, &binding("r1", "alice")).await.unwrap(),
            AttachOutcome::Attached {
                first_session: true
            }
        );
        assert_eq!(
            store.attach(tab2, &binding("r1", "alice")).await.unwrap(),
            AttachOutcome::Attached {
                first_session: false
            }
        );
        assert_eq!(
            store
                .session_count(&RoomId::from("r1"), &ParticipantId::from("alice"))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store.list_members(&RoomId::from("r1")).await.unwrap(),
            vec![ParticipantId::from("alice")]
        );
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_for_same_binding() {
        let store = InMemoryPresenceStore::new();
        let conn = ConnectionId::new();

        store.attach(conn, &binding("r1", "alice")).await.unwrap();
        assert_eq!(
            store.attach(conn, &binding("r1", "alice")).await.unwrap(),
            AttachOutcome::AlreadyBound
        );
        assert_eq!(
            store.attach(conn, &binding("r2", "alice")).await.unwrap(),
            AttachOutcome::BoundElsewhere
        );
        assert_eq!(
            store
                .session_count(&RoomId::from("r1"), &ParticipantId::from("alice"))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_detach_removes_member_on_last_session_only() {
        let store = InMemoryPresenceStore::new();
        let tab1 = ConnectionId::new();
        let tab2 = ConnectionId::new();
        store.attach(tab1, &binding("r1", "alice")).await.unwrap();
        store.attach(tab2, &binding("r1", "alice")).await.unwrap();

        let first = store.detach(tab1).await.unwrap().unwrap();
        assert!(!first.last_session);
        assert_eq!(store.list_members(&RoomId::from("r1")).await.unwrap().len(), 1);

        let second = store.detach(tab2).await.unwrap().unwrap();
        assert!(second.last_session);
        assert!(store.list_members(&RoomId::from("r1")).await.unwrap().is_empty());

        assert_eq!(store.detach(tab2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_attach_counts_exactly_one_first_session() {
        let store = Arc::new(InMemoryPresenceStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .attach(ConnectionId::new(), &binding("r1", "alice"))
                    .await
                    .unwrap()
            }));
        }

        let mut firsts = 0;
        for handle in handles {
            if handle.await.unwrap()
                == (AttachOutcome::Attached {
                    first_session: true,
                })
            {
                firsts += 1;
            }
        }
        assert_eq!(firsts, 1);
    }

    #[tokio::test]
    async fn test_session_lease_is_exclusive_until_released() {
        let store = InMemoryPresenceStore::new();
        let room = RoomId::from("r1");
        let alice = ParticipantId::from("alice");
        let ttl = Duration::from_secs(5);

        let lease = store.try_acquire_lease(&room, &alice, ttl).await.unwrap().unwrap();
        assert!(store.try_acquire_lease(&room, &alice, ttl).await.unwrap().is_none());

        // Other participants and rooms are independent
        assert!(store
            .try_acquire_lease(&room, &ParticipantId::from("bob"), ttl)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .try_acquire_lease(&RoomId::from("r2"), &alice, ttl)
            .await
            .unwrap()
            .is_some());

        assert!(store.release_lease(&lease).await.unwrap());
        let next = store.try_acquire_lease(&room, &alice, ttl).await.unwrap().unwrap();
        assert!(next.generation > lease.generation);
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_release_its_successor() {
        let store = InMemoryPresenceStore::new();
        let room = RoomId::from("r1");
        let alice = ParticipantId::from("alice");

        let stale = store
            .try_acquire_lease(&room, &alice, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let current = store
            .try_acquire_lease(&room, &alice, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("expired lease is taken over");
        assert!(current.generation > stale.generation);

        assert!(!store.release_lease(&stale).await.unwrap());
        assert!(store
            .try_acquire_lease(&room, &alice, Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
        assert!(store.release_lease(&current).await.unwrap());
    }
}
