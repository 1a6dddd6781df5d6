//! Join, leave and disconnect.

use super::SessionGateway;
use crate::collaborators::AttendanceStatus;
use crate::errors::CsError;
use crate::presence::{AttachOutcome, Binding, DetachOutcome};
use crate::protocol::{JoinRoom, ProducerClosed, RoomRef, ServerEvent, UserJoined, UserLeft};
use common::types::{ConnectionId, RoomId};
use tracing::{debug, error, info, instrument, warn};

/// Why a connection is leaving its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Explicit `leave-room`.
    Leave,
    /// `join-room` for another room.
    Switch,
    /// Socket closed.
    Disconnect,
}

impl SessionGateway {
    #[instrument(skip_all, fields(connection_id = %connection, room = %req.class_id, user_id = %req.user_id))]
    pub(super) async fn join(
        &self,
        connection: ConnectionId,
        req: JoinRoom,
    ) -> Result<Vec<ServerEvent>, CsError> {
        if req.user_id.as_str().trim().is_empty() {
            return Err(CsError::Validation("userId is required".to_string()));
        }
        let room = req.class_id;

        let existing = self.presence.lookup_connection(connection).await?;
        if let Some(existing) = &existing {
            if existing.room == room && existing.participant == req.user_id {
                debug!(target: "cs.gateway", connection_id = %connection, "Connection already joined, resending snapshot");
                self.bus.join_room(connection, &room);
                let members = self.presence.list_members(&room).await?;
                return Ok(vec![
                    ServerEvent::JoinedRoom(RoomRef { class_id: room }),
                    ServerEvent::CurrentAttendance(members),
                ]);
            }
        }

        // The old room is only left once the new one is known to be valid
        let directory = &self.collaborators.directory;
        let user = self
            .backend_call("find_user", directory.find_user_by_id(&req.user_id))
            .await?;
        self.backend_call("find_class", directory.find_class_by_id(&room))
            .await?;

        if let Some(existing) = existing {
            info!(target: "cs.gateway", connection_id = %connection, from = %existing.room, to = %room, "Switching rooms");
            self.depart(connection, Departure::Switch).await?;
        }

        let display_name = match req.full_name.trim() {
            "" => user.full_name,
            name => name.to_string(),
        };
        let binding = Binding::new(room.clone(), req.user_id, display_name);

        self.media.enter(&room, connection).await?;
        self.media_rooms.insert(connection, room.clone());

        let first_session = match self.attach(connection, &binding).await {
            Ok(first_session) => first_session,
            Err(e) => {
                self.release_media(connection).await;
                return Err(e);
            }
        };

        self.bus.join_room(connection, &room);
        let members = match self.presence.list_members(&room).await {
            Ok(members) => members,
            Err(e) => {
                warn!(target: "cs.gateway", connection_id = %connection, error = %e, "Snapshot read failed, rolling back join");
                if let Err(rollback) = self.depart(connection, Departure::Leave).await {
                    error!(target: "cs.gateway", connection_id = %connection, error = %rollback, "Join rollback failed");
                }
                return Err(e);
            }
        };

        if first_session {
            self.bus.broadcast_to_room(
                &room,
                ServerEvent::UserJoined(UserJoined {
                    user_id: binding.participant.clone(),
                    full_name: binding.display_name.clone(),
                    connection_id: connection,
                }),
                Some(connection),
            );
        }

        info!(
            target: "cs.gateway",
            connection_id = %connection,
            room = %room,
            first_session,
            members = members.len(),
            "Joined room"
        );
        Ok(vec![
            ServerEvent::JoinedRoom(RoomRef { class_id: room }),
            ServerEvent::CurrentAttendance(members),
        ])
    }

    /// Bind the connection and record "joined" on the participant's first
    /// session. Returns whether this was the first session.
    async fn attach(&self, connection: ConnectionId, binding: &Binding) -> Result<bool, CsError> {
        let lease = self
            .acquire_session(&binding.room, &binding.participant)
            .await?;
        let attached = self.attach_leased(connection, binding).await;
        self.release_session(&lease).await;
        attached
    }

    async fn attach_leased(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<bool, CsError> {
        let first_session = match self.presence.attach(connection, binding).await? {
            AttachOutcome::Attached { first_session } => first_session,
            AttachOutcome::AlreadyBound => false,
            AttachOutcome::BoundElsewhere => {
                return Err(CsError::Conflict(
                    "connection is bound to another room".to_string(),
                ));
            }
        };

        if first_session {
            let recorded = self
                .backend_call(
                    "record_attendance",
                    self.collaborators.attendance.record_attendance_event(
                        &binding.participant,
                        &binding.room,
                        AttendanceStatus::Joined,
                    ),
                )
                .await;
            if let Err(e) = recorded {
                if let Err(undo) = self.presence.detach(connection).await {
                    error!(target: "cs.gateway", connection_id = %connection, error = %undo, "Failed to undo binding after attendance failure");
                }
                return Err(e);
            }
        }
        Ok(first_session)
    }

    pub(super) async fn leave(
        &self,
        connection: ConnectionId,
        room: &RoomId,
    ) -> Result<Vec<ServerEvent>, CsError> {
        if let Some(binding) = self.presence.lookup_connection(connection).await? {
            if &binding.room != room {
                return Err(CsError::Conflict(
                    "connection is in a different room".to_string(),
                ));
            }
            self.depart(connection, Departure::Leave).await?;
        }
        Ok(vec![ServerEvent::LeftRoom(RoomRef {
            class_id: room.clone(),
        })])
    }

    /// Tear down everything a closed connection held.
    ///
    /// Failures are logged, never returned: the socket is already gone. Media
    /// owned by the connection is released even when the presence store is
    /// unreachable.
    #[instrument(skip_all, fields(connection_id = %connection))]
    pub async fn disconnect(&self, connection: ConnectionId) {
        if let Err(e) = self.depart(connection, Departure::Disconnect).await {
            error!(target: "cs.gateway", connection_id = %connection, error = %e, "Presence cleanup failed on disconnect");
            self.release_media(connection).await;
        }
        self.bus.unregister(connection);
        debug!(target: "cs.gateway", connection_id = %connection, "Connection closed");
    }

    /// Remove the connection's binding and release its room resources.
    ///
    /// On the participant's last session, records "left" and broadcasts
    /// `user-left`. Without a binding this is a no-op.
    async fn depart(&self, connection: ConnectionId, departure: Departure) -> Result<(), CsError> {
        let Some(binding) = self.presence.lookup_connection(connection).await? else {
            return Ok(());
        };

        let lease = self
            .acquire_session(&binding.room, &binding.participant)
            .await?;
        let detached = self.detach_leased(connection, departure).await;
        self.release_session(&lease).await;
        let Some(outcome) = detached? else {
            return Ok(());
        };

        let room = &outcome.binding.room;
        self.bus.leave_room(connection, room);
        let producers = self.release_media(connection).await;

        if outcome.last_session {
            self.bus.broadcast_to_room(
                room,
                ServerEvent::UserLeft(UserLeft {
                    user_id: outcome.binding.participant.clone(),
                    connection_id: connection,
                }),
                Some(connection),
            );
        }
        for producer_id in producers {
            self.bus.broadcast_to_room(
                room,
                ServerEvent::ProducerClosed(ProducerClosed { producer_id }),
                Some(connection),
            );
        }

        info!(
            target: "cs.gateway",
            connection_id = %connection,
            room = %room,
            ?departure,
            last_session = outcome.last_session,
            "Left room"
        );
        Ok(())
    }

    /// Unbind the connection and record "left" on the participant's last
    /// session. Returns `None` when the binding was already gone.
    async fn detach_leased(
        &self,
        connection: ConnectionId,
        departure: Departure,
    ) -> Result<Option<DetachOutcome>, CsError> {
        let Some(outcome) = self.presence.detach(connection).await? else {
            return Ok(None);
        };

        if outcome.last_session {
            let recorded = self
                .backend_call(
                    "record_attendance",
                    self.collaborators.attendance.record_attendance_event(
                        &outcome.binding.participant,
                        &outcome.binding.room,
                        AttendanceStatus::Left,
                    ),
                )
                .await;
            if let Err(e) = recorded {
                if departure == Departure::Disconnect {
                    warn!(target: "cs.gateway", connection_id = %connection, error = %e, "Failed to record attendance on disconnect");
                } else {
                    if let Err(undo) = self.presence.attach(connection, &outcome.binding).await {
                        error!(target: "cs.gateway", connection_id = %connection, error = %undo, "Failed to restore binding after attendance failure");
                    }
                    return Err(e);
                }
            }
        }
        Ok(Some(outcome))
    }

    /// Release the connection's media session, returning its closed
    /// producers.
    async fn release_media(&self, connection: ConnectionId) -> Vec<crate::media::ProducerId> {
        let Some((_, room)) = self.media_rooms.remove(&connection) else {
            return Vec::new();
        };
        self.bus.leave_room(connection, &room);
        self.media.release_connection(&room, connection).await.producers
    }
}
