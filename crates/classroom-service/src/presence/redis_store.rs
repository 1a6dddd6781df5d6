//! Redis-backed presence store.
//!
//! # Key Patterns
//!
//! - `classroom:room:{id}:members` - Room member set (SET of participant ids)
//! - `classroom:room:{id}:sessions` - Sessions per participant (HASH participant -> count)
//! - `classroom:conn:{id}` - Connection binding (HASH room, participant, display_name)
//! - `classroom:room:{id}:lease:{participant}` - Session lease (STRING generation, with PX expiry)
//! - `classroom:room:{id}:lease-generations` - Lease fencing generations (HASH participant -> generation)
//!
//! # Connection Pattern
//!
//! The `MultiplexedConnection` is cheap to clone and safe to use concurrently,
//! so each operation clones it instead of locking. Every call is bounded by the
//! configured operation timeout; failures and timeouts surface as
//! [`CsError::StoreUnavailable`].

use super::{lua_scripts, AttachOutcome, Binding, DetachOutcome, PresenceStore, SessionLease};
use crate::errors::CsError;
use crate::observability::metrics::record_store_latency;
use async_trait::async_trait;
use common::types::{ConnectionId, ParticipantId, RoomId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Attempts made by `detach` when the binding changes between read and script.
const DETACH_ATTEMPTS: usize = 3;

fn members_key(room: &RoomId) -> String {
    format!("classroom:room:{room}:members")
}

fn sessions_key(room: &RoomId) -> String {
    format!("classroom:room:{room}:sessions")
}

fn lease_key(room: &RoomId, participant: &ParticipantId) -> String {
    format!("classroom:room:{room}:lease:{participant}")
}

fn lease_generations_key(room: &RoomId) -> String {
    format!("classroom:room:{room}:lease-generations")
}

fn connection_key(connection: ConnectionId) -> String {
    format!("classroom:conn:{connection}")
}

/// Redis [`PresenceStore`].
#[derive(Clone)]
pub struct RedisPresenceStore {
    connection: MultiplexedConnection,
    op_timeout: Duration,
    attach_script: Script,
    detach_script: Script,
    acquire_lease_script: Script,
    release_lease_script: Script,
}

impl RedisPresenceStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CsError::StoreUnavailable` if the client cannot be opened or
    /// the initial connection fails.
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self, CsError> {
        let client = Client::open(redis_url).map_err(|e| {
            // The URL may carry credentials; log only the error
            error!(target: "cs.presence", error = %e, "Failed to open Redis client");
            CsError::StoreUnavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = tokio::time::timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                error!(target: "cs.presence", "Timed out connecting to Redis");
                CsError::StoreUnavailable("Timed out connecting to Redis".to_string())
            })?
            .map_err(|e| {
                error!(target: "cs.presence", error = %e, "Failed to connect to Redis");
                CsError::StoreUnavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            op_timeout,
            attach_script: Script::new(lua_scripts::ATTACH),
            detach_script: Script::new(lua_scripts::DETACH),
            acquire_lease_script: Script::new(lua_scripts::ACQUIRE_LEASE),
            release_lease_script: Script::new(lua_scripts::RELEASE_LEASE),
        })
    }

    /// Run one Redis call under the operation timeout and record its latency.
    async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T, CsError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let start = Instant::now();
        let result = tokio::time::timeout(self.op_timeout, call).await;
        record_store_latency(operation, start.elapsed());

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(target: "cs.presence", operation, error = %e, "Redis operation failed");
                Err(CsError::StoreUnavailable(format!("{operation} failed: {e}")))
            }
            Err(_) => {
                warn!(target: "cs.presence", operation, "Redis operation timed out");
                Err(CsError::StoreUnavailable(format!("{operation} timed out")))
            }
        }
    }

    async fn read_binding(&self, connection: ConnectionId) -> Result<Option<Binding>, CsError> {
        let mut conn = self.connection.clone();
        let key = connection_key(connection);
        let fields: HashMap<String, String> = self
            .run("hgetall", async move { conn.hgetall(&key).await })
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        match (fields.get("room"), fields.get("participant")) {
            (Some(room), Some(participant)) => Ok(Some(Binding::new(
                RoomId::new(room.as_str()),
                ParticipantId::new(participant.as_str()),
                fields.get("display_name").cloned().unwrap_or_default(),
            ))),
            _ => Err(CsError::Internal(format!(
                "malformed binding record for connection {connection}"
            ))),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    #[instrument(skip_all, fields(room = %room))]
    async fn add_member(&self, room: &RoomId, participant: &ParticipantId) -> Result<(), CsError> {
        let mut conn = self.connection.clone();
        let key = members_key(room);
        self.run("sadd", async move {
            conn.sadd::<_, _, ()>(&key, participant.as_str()).await
        })
        .await
    }

    #[instrument(skip_all, fields(room = %room))]
    async fn remove_member(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), CsError> {
        let mut conn = self.connection.clone();
        let key = members_key(room);
        self.run("srem", async move {
            conn.srem::<_, _, ()>(&key, participant.as_str()).await
        })
        .await
    }

    #[instrument(skip_all, fields(room = %room))]
    async fn list_members(&self, room: &RoomId) -> Result<Vec<ParticipantId>, CsError> {
        let mut conn = self.connection.clone();
        let key = members_key(room);
        let mut members: Vec<String> = self
            .run("smembers", async move { conn.smembers(&key).await })
            .await?;
        members.sort();
        Ok(members.into_iter().map(ParticipantId::new).collect())
    }

    #[instrument(skip_all, fields(connection_id = %connection))]
    async fn bind_connection(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<(), CsError> {
        let mut conn = self.connection.clone();
        let key = connection_key(connection);
        let fields = [
            ("room", binding.room.as_str()),
            ("participant", binding.participant.as_str()),
            ("display_name", binding.display_name.as_str()),
        ];
        self.run("hset", async move {
            conn.hset_multiple::<_, _, _, ()>(&key, &fields).await
        })
        .await
    }

    #[instrument(skip_all, fields(connection_id = %connection))]
    async fn lookup_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError> {
        self.read_binding(connection).await
    }

    #[instrument(skip_all, fields(connection_id = %connection))]
    async fn unbind_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Binding>, CsError> {
        let binding = self.read_binding(connection).await?;
        if binding.is_some() {
            let mut conn = self.connection.clone();
            let key = connection_key(connection);
            self.run("del", async move { conn.del::<_, ()>(&key).await })
                .await?;
        }
        Ok(binding)
    }

    #[instrument(skip_all, fields(connection_id = %connection, room = %binding.room))]
    async fn attach(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<AttachOutcome, CsError> {
        let mut conn = self.connection.clone();
        let conn_key = connection_key(connection);
        let members = members_key(&binding.room);
        let sessions = sessions_key(&binding.room);
        let script = &self.attach_script;

        let result: i64 = self
            .run("attach", async move {
                script
                    .key(&conn_key)
                    .key(&members)
                    .key(&sessions)
                    .arg(binding.room.as_str())
                    .arg(binding.participant.as_str())
                    .arg(binding.display_name.as_str())
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let outcome = match result {
            1 => AttachOutcome::Attached {
                first_session: true,
            },
            2 => AttachOutcome::Attached {
                first_session: false,
            },
            0 => AttachOutcome::AlreadyBound,
            -1 => AttachOutcome::BoundElsewhere,
            other => {
                error!(target: "cs.presence", result = other, "Unexpected attach script result");
                return Err(CsError::Internal(format!(
                    "unexpected attach script result: {other}"
                )));
            }
        };

        debug!(target: "cs.presence", connection_id = %connection, ?outcome, "Connection attached");
        Ok(outcome)
    }

    #[instrument(skip_all, fields(connection_id = %connection))]
    async fn detach(&self, connection: ConnectionId) -> Result<Option<DetachOutcome>, CsError> {
        for _ in 0..DETACH_ATTEMPTS {
            let Some(binding) = self.read_binding(connection).await? else {
                return Ok(None);
            };

            let mut conn = self.connection.clone();
            let conn_key = connection_key(connection);
            let members = members_key(&binding.room);
            let sessions = sessions_key(&binding.room);
            let script = &self.detach_script;
            let room = binding.room.as_str();
            let participant = binding.participant.as_str();

            let result: i64 = self
                .run("detach", async move {
                    script
                        .key(&conn_key)
                        .key(&members)
                        .key(&sessions)
                        .arg(room)
                        .arg(participant)
                        .invoke_async(&mut conn)
                        .await
                })
                .await?;

            match result {
                1 | 0 => {
                    return Ok(Some(DetachOutcome {
                        binding,
                        last_session: result == 1,
                    }))
                }
                -1 => return Ok(None),
                -2 => {
                    debug!(target: "cs.presence", connection_id = %connection, "Binding changed during detach, retrying");
                }
                other => {
                    return Err(CsError::Internal(format!(
                        "unexpected detach script result: {other}"
                    )))
                }
            }
        }

        Err(CsError::Conflict(
            "connection binding changed concurrently".to_string(),
        ))
    }

    #[instrument(skip_all, fields(room = %room))]
    async fn session_count(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<u64, CsError> {
        let mut conn = self.connection.clone();
        let key = sessions_key(room);
        let count: Option<i64> = self
            .run("hget", async move { conn.hget(&key, participant.as_str()).await })
            .await?;
        Ok(count.and_then(|c| u64::try_from(c).ok()).unwrap_or(0))
    }

    #[instrument(skip_all, fields(room = %room))]
    async fn try_acquire_lease(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
        ttl: Duration,
    ) -> Result<Option<SessionLease>, CsError> {
        let mut conn = self.connection.clone();
        let lease = lease_key(room, participant);
        let generations = lease_generations_key(room);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let script = &self.acquire_lease_script;

        let result: i64 = self
            .run("acquire_lease", async move {
                script
                    .key(&lease)
                    .key(&generations)
                    .arg(participant.as_str())
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        match u64::try_from(result) {
            Ok(0) => Ok(None),
            Ok(generation) => {
                debug!(target: "cs.presence", room = %room, generation, "Session lease granted");
                Ok(Some(SessionLease {
                    room: room.clone(),
                    participant: participant.clone(),
                    generation,
                }))
            }
            Err(_) => Err(CsError::Internal(format!(
                "unexpected acquire_lease script result: {result}"
            ))),
        }
    }

    #[instrument(skip_all, fields(room = %lease.room, generation = lease.generation))]
    async fn release_lease(&self, lease: &SessionLease) -> Result<bool, CsError> {
        let mut conn = self.connection.clone();
        let key = lease_key(&lease.room, &lease.participant);
        let generation = lease.generation;
        let script = &self.release_lease_script;

        let released: i64 = self
            .run("release_lease", async move {
                script
                    .key(&key)
                    .arg(generation)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let room = RoomId::from("class-1");
        assert_eq!(members_key(&room), "classroom:room:class-1:members");
        assert_eq!(sessions_key(&room), "classroom:room:class-1:sessions");

        assert_eq!(
            lease_key(&room, &ParticipantId::from("alice")),
            "classroom:room:class-1:lease:alice"
        );
        assert_eq!(
            lease_generations_key(&room),
            "classroom:room:class-1:lease-generations"
        );

        let conn = ConnectionId::new();
        assert_eq!(connection_key(conn), format!("classroom:conn:{conn}"));
    }
}
