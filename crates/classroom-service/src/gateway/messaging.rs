//! Chat, WebRTC signaling and relay-only events.

use super::SessionGateway;
use crate::errors::CsError;
use crate::protocol::{
    AnswerBroadcast, CandidateBroadcast, ChatBroadcast, ChatMessage, ChatUser, OfferBroadcast,
    Relay, RelayBroadcast, ServerEvent, Signal,
};
use common::types::{ConnectionId, RoomId};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RelayKind {
    RequestToSpeak,
    /// Always addressed to one connection.
    AllowToSpeak,
    DrawEvent,
    SessionStateChanged,
}

impl SessionGateway {
    /// Persist a chat message, then broadcast it to the whole room.
    #[instrument(skip_all, fields(connection_id = %connection, room = %req.class_id))]
    pub(super) async fn chat(
        &self,
        connection: ConnectionId,
        req: ChatMessage,
    ) -> Result<Vec<ServerEvent>, CsError> {
        let binding = self.require_binding(connection, &req.class_id).await?;
        if binding.participant != req.user_id {
            return Err(CsError::Unauthorized(
                "userId does not match the joined participant".to_string(),
            ));
        }
        if req.message.trim().is_empty() {
            return Err(CsError::Validation("message is required".to_string()));
        }

        let record = self
            .backend_call(
                "create_chat_message",
                self.collaborators.chat.create_chat_message(
                    &req.message,
                    &binding.participant,
                    &binding.room,
                ),
            )
            .await?;

        debug!(target: "cs.gateway", connection_id = %connection, message_id = %record.message_id, "Chat message persisted");
        self.bus.broadcast_to_room(
            &binding.room,
            ServerEvent::ChatMessage(ChatBroadcast {
                id: record.message_id,
                message: record.message,
                sender_id: connection,
                created_at: record.created_at,
                user: ChatUser {
                    user_id: record.user.user_id,
                    full_name: record.user.full_name,
                },
            }),
            None,
        );
        Ok(Vec::new())
    }

    /// Forward an offer, answer or ICE candidate: unicast when `targetId`
    /// is set, otherwise to the rest of the room.
    pub(super) async fn signal(
        &self,
        connection: ConnectionId,
        signal: Signal,
        kind: SignalKind,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &signal.class_id).await?;

        let sender_id = connection;
        let event = match kind {
            SignalKind::Offer => ServerEvent::WebrtcOffer(OfferBroadcast {
                offer: signal.payload,
                sender_id,
            }),
            SignalKind::Answer => ServerEvent::WebrtcAnswer(AnswerBroadcast {
                answer: signal.payload,
                sender_id,
            }),
            SignalKind::IceCandidate => ServerEvent::WebrtcIceCandidate(CandidateBroadcast {
                candidate: signal.payload,
                sender_id,
            }),
        };

        self.forward(connection, &signal.class_id, signal.target_id, event)
            .await?;
        Ok(Vec::new())
    }

    pub(super) async fn relay(
        &self,
        connection: ConnectionId,
        relay: Relay,
        kind: RelayKind,
    ) -> Result<Vec<ServerEvent>, CsError> {
        self.require_binding(connection, &relay.class_id).await?;
        if kind == RelayKind::AllowToSpeak && relay.target_id.is_none() {
            return Err(CsError::Validation(
                "targetId is required for allow-to-speak".to_string(),
            ));
        }

        let payload = RelayBroadcast {
            sender_id: connection,
            body: relay.body,
        };
        let event = match kind {
            RelayKind::RequestToSpeak => ServerEvent::RequestToSpeak(payload),
            RelayKind::AllowToSpeak => ServerEvent::AllowToSpeak(payload),
            RelayKind::DrawEvent => ServerEvent::DrawEvent(payload),
            RelayKind::SessionStateChanged => ServerEvent::SessionStateChanged(payload),
        };

        self.forward(connection, &relay.class_id, relay.target_id, event)
            .await?;
        Ok(Vec::new())
    }

    /// Unicast to `target`, which must be bound to `room`, or broadcast to
    /// the room without the sender. Never both.
    async fn forward(
        &self,
        connection: ConnectionId,
        room: &RoomId,
        target: Option<ConnectionId>,
        event: ServerEvent,
    ) -> Result<(), CsError> {
        match target {
            Some(target) => {
                let in_room = self
                    .presence
                    .lookup_connection(target)
                    .await?
                    .is_some_and(|binding| &binding.room == room);
                if !in_room {
                    return Err(CsError::NotFound(
                        "target connection is not in this room".to_string(),
                    ));
                }
                self.bus.send_to_connection(target, event);
            }
            None => self.bus.broadcast_to_room(room, event, Some(connection)),
        }
        Ok(())
    }
}
