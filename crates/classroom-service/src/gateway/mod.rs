//! Session Gateway: per-message dispatch for signaling connections.
//!
//! Every inbound frame is parsed into a [`ClientEvent`] and routed through
//! [`SessionGateway::handle_event`], an explicit table from event to handler.
//! A handler returns the events addressed to the caller; room broadcasts and
//! unicasts to other connections go through the [`EventBus`] from inside the
//! handler. Any failure becomes a single scoped `error` event for the caller
//! and skips the handler's remaining side effects.
//!
//! # Ordering
//!
//! Join and leave for one participant in one room are serialized by a session
//! lease from the presence store, held around the presence update and the
//! attendance record. The lease lives in the shared store, so the ordering
//! holds across nodes and attendance alternates `joined, left, joined, ...`.
//! Chat is persisted before it is broadcast.

mod media;
mod messaging;
mod session;

use crate::bus::EventBus;
use crate::collaborators::Collaborators;
use crate::errors::CsError;
use crate::media::MediaRouterRegistry;
use crate::observability::metrics::{record_handler_error, record_message_latency};
use crate::presence::{Binding, PresenceStore, SessionLease};
use crate::protocol::{parse_client_frame, ClientEvent, ServerEvent};
use common::types::{ConnectionId, ParticipantId, RoomId};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Lease lifetime, in multiples of the call timeout. Covers the store update,
/// the attendance call and a rollback.
const SESSION_LEASE_CALL_TIMEOUTS: u32 = 4;

const LEASE_RETRY_INITIAL: Duration = Duration::from_millis(5);
const LEASE_RETRY_MAX: Duration = Duration::from_millis(100);

/// Coordinates presence, media, fan-out and collaborators for every
/// signaling connection hosted on this node.
pub struct SessionGateway {
    presence: Arc<dyn PresenceStore>,
    media: Arc<MediaRouterRegistry>,
    bus: Arc<dyn EventBus>,
    collaborators: Collaborators,
    call_timeout: Duration,
    /// Room whose media session each local connection entered.
    media_rooms: DashMap<ConnectionId, RoomId>,
}

impl SessionGateway {
    #[must_use]
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        media: Arc<MediaRouterRegistry>,
        bus: Arc<dyn EventBus>,
        collaborators: Collaborators,
        call_timeout: Duration,
    ) -> Self {
        Self {
            presence,
            media,
            bus,
            collaborators,
            call_timeout,
            media_rooms: DashMap::new(),
        }
    }

    /// Register a freshly accepted connection and return its outbox.
    pub fn connect(&self, connection: ConnectionId) -> mpsc::Receiver<ServerEvent> {
        debug!(target: "cs.gateway", connection_id = %connection, "Connection registered");
        self.bus.register(connection)
    }

    /// Queue an event for one local connection.
    pub fn send_to(&self, connection: ConnectionId, event: ServerEvent) {
        self.bus.send_to_connection(connection, event);
    }

    /// Parse and handle one inbound text frame.
    ///
    /// Replies and errors are delivered through the connection's outbox.
    #[instrument(skip_all, fields(connection_id = %connection))]
    pub async fn handle_frame(&self, connection: ConnectionId, frame: &str) {
        let start = Instant::now();
        let event = match parse_client_frame(frame) {
            Ok(event) => event,
            Err((name, err)) => {
                self.reject(connection, name, &err);
                record_message_latency(name.unwrap_or("unknown"), start.elapsed());
                return;
            }
        };

        let name = event.name();
        match self.handle_event(connection, event).await {
            Ok(replies) => {
                for reply in replies {
                    self.bus.send_to_connection(connection, reply);
                }
            }
            Err(err) => self.reject(connection, Some(name), &err),
        }
        record_message_latency(name, start.elapsed());
    }

    /// Run the handler for one event and return the caller's replies.
    ///
    /// # Errors
    ///
    /// Whatever the handler fails with; nothing after the failing step has
    /// been applied.
    #[instrument(skip_all, fields(connection_id = %connection, event = event.name(), room = %event.class_id()))]
    pub async fn handle_event(
        &self,
        connection: ConnectionId,
        event: ClientEvent,
    ) -> Result<Vec<ServerEvent>, CsError> {
        if event.class_id().as_str().trim().is_empty() {
            return Err(CsError::Validation("classId is required".to_string()));
        }

        match event {
            ClientEvent::JoinRoom(req) => self.join(connection, req).await,
            ClientEvent::LeaveRoom(req) => self.leave(connection, &req.class_id).await,
            ClientEvent::ChatMessage(req) => self.chat(connection, req).await,
            ClientEvent::WebrtcOffer(signal) => {
                self.signal(connection, signal, messaging::SignalKind::Offer)
                    .await
            }
            ClientEvent::WebrtcAnswer(signal) => {
                self.signal(connection, signal, messaging::SignalKind::Answer)
                    .await
            }
            ClientEvent::WebrtcIceCandidate(signal) => {
                self.signal(connection, signal, messaging::SignalKind::IceCandidate)
                    .await
            }
            ClientEvent::GetRouterRtpCapabilities(req) => {
                self.router_capabilities(connection, &req.class_id).await
            }
            ClientEvent::CreateTransport(req) => self.create_transport(connection, req).await,
            ClientEvent::ConnectTransport(req) => self.connect_transport(connection, req).await,
            ClientEvent::Produce(req) => self.produce(connection, req).await,
            ClientEvent::Consume(req) => self.consume(connection, req).await,
            ClientEvent::ResumeConsumer(req) => self.resume_consumer(connection, req).await,
            ClientEvent::CloseProducer(req) => self.close_producer(connection, req).await,
            ClientEvent::SetAudioMode(req) => self.set_audio_mode(connection, req).await,
            ClientEvent::RequestToSpeak(relay) => {
                self.relay(connection, relay, messaging::RelayKind::RequestToSpeak)
                    .await
            }
            ClientEvent::AllowToSpeak(relay) => {
                self.relay(connection, relay, messaging::RelayKind::AllowToSpeak)
                    .await
            }
            ClientEvent::DrawEvent(relay) => {
                self.relay(connection, relay, messaging::RelayKind::DrawEvent)
                    .await
            }
            ClientEvent::SessionStateChanged(relay) => {
                self.relay(connection, relay, messaging::RelayKind::SessionStateChanged)
                    .await
            }
        }
    }

    fn reject(&self, connection: ConnectionId, event: Option<&'static str>, err: &CsError) {
        let label = event.unwrap_or("unknown");
        match err {
            CsError::Internal(_)
            | CsError::Config(_)
            | CsError::StoreUnavailable(_)
            | CsError::BackendUnavailable(_)
            | CsError::Timeout(_) => {
                warn!(target: "cs.gateway", connection_id = %connection, event = label, error = %err, "Handler failed");
            }
            _ => {
                debug!(target: "cs.gateway", connection_id = %connection, event = label, error = %err, "Request rejected");
            }
        }
        record_handler_error(label, err.error_type_label());
        self.bus
            .send_to_connection(connection, ServerEvent::error(event, err));
    }

    /// The caller's binding, which must be for `room`.
    async fn require_binding(
        &self,
        connection: ConnectionId,
        room: &RoomId,
    ) -> Result<Binding, CsError> {
        match self.presence.lookup_connection(connection).await? {
            Some(binding) if &binding.room == room => Ok(binding),
            Some(_) => Err(CsError::Unauthorized(
                "connection has not joined this room".to_string(),
            )),
            None => Err(CsError::Unauthorized("join the room first".to_string())),
        }
    }

    fn session_lease_ttl(&self) -> Duration {
        self.call_timeout * SESSION_LEASE_CALL_TIMEOUTS
    }

    /// Wait for the participant's session lease, at most one lease lifetime.
    ///
    /// # Errors
    ///
    /// `Timeout` if the lease stays held, or whatever the store fails with.
    async fn acquire_session(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<SessionLease, CsError> {
        let ttl = self.session_lease_ttl();
        let deadline = Instant::now() + ttl;
        let mut backoff = LEASE_RETRY_INITIAL;

        loop {
            if let Some(lease) = self
                .presence
                .try_acquire_lease(room, participant, ttl)
                .await?
            {
                return Ok(lease);
            }
            if Instant::now() + backoff > deadline {
                warn!(target: "cs.gateway", room = %room, user_id = %participant, "Session lease still held, giving up");
                return Err(CsError::Timeout(
                    "participant session is busy".to_string(),
                ));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(LEASE_RETRY_MAX);
        }
    }

    async fn release_session(&self, lease: &SessionLease) {
        match self.presence.release_lease(lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(target: "cs.gateway", room = %lease.room, generation = lease.generation, "Session lease expired before release");
            }
            Err(e) => {
                warn!(target: "cs.gateway", room = %lease.room, generation = lease.generation, error = %e, "Failed to release session lease");
            }
        }
    }

    /// Bound a collaborator call by the configured deadline.
    async fn backend_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, CsError>
    where
        F: Future<Output = Result<T, CsError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(target: "cs.gateway", operation, "Backend call timed out");
                Err(CsError::Timeout(format!("backend {operation} timed out")))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::collaborators::{
        AttendanceClient, AttendanceStatus, ChatClient, ChatMessageRecord, ClassRecord,
        DirectoryClient, UserRecord,
    };
    use crate::media::{LoopbackMediaEngine, WorkerPool};
    use crate::presence::InMemoryPresenceStore;
    use async_trait::async_trait;

    struct SlowBackend;

    #[async_trait]
    impl DirectoryClient for SlowBackend {
        async fn find_user_by_id(&self, _user: &ParticipantId) -> Result<UserRecord, CsError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(CsError::NotFound("user not found".to_string()))
        }

        async fn find_class_by_id(&self, class: &RoomId) -> Result<ClassRecord, CsError> {
            Ok(ClassRecord {
                class_id: class.clone(),
                class_name: String::new(),
            })
        }
    }

    #[async_trait]
    impl AttendanceClient for SlowBackend {
        async fn record_attendance_event(
            &self,
            _user: &ParticipantId,
            _class: &RoomId,
            _status: AttendanceStatus,
        ) -> Result<(), CsError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChatClient for SlowBackend {
        async fn create_chat_message(
            &self,
            _message: &str,
            _user: &ParticipantId,
            _class: &RoomId,
        ) -> Result<ChatMessageRecord, CsError> {
            Err(CsError::Internal("unused".to_string()))
        }
    }

    fn gateway() -> (SessionGateway, Arc<InMemoryPresenceStore>) {
        let presence = Arc::new(InMemoryPresenceStore::new());
        let media = Arc::new(MediaRouterRegistry::new(
            Arc::new(LoopbackMediaEngine::new("127.0.0.1")),
            WorkerPool::new(1),
            Duration::from_secs(1),
        ));
        let gateway = SessionGateway::new(
            Arc::clone(&presence) as Arc<dyn PresenceStore>,
            media,
            Arc::new(LocalEventBus::new()),
            Collaborators::from_backend(Arc::new(SlowBackend)),
            Duration::from_millis(50),
        );
        (gateway, presence)
    }

    #[tokio::test]
    async fn test_empty_class_id_is_rejected() {
        let (gateway, _) = gateway();
        let connection = ConnectionId::new();
        let mut outbox = gateway.connect(connection);

        gateway
            .handle_frame(
                connection,
                r#"{"event":"get-router-rtp-capabilities","data":{"classId":"  "}}"#,
            )
            .await;

        match outbox.recv().await.unwrap() {
            ServerEvent::Error(payload) => {
                assert_eq!(payload.code, 1);
                assert_eq!(payload.event.as_deref(), Some("get-router-rtp-capabilities"));
            }
            other => unreachable!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (gateway, _) = gateway();
        let connection = ConnectionId::new();
        let mut outbox = gateway.connect(connection);

        gateway.handle_frame(connection, "{not json").await;

        assert!(matches!(outbox.recv().await.unwrap(), ServerEvent::Error(_)));
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_frames_are_timed() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _recorder_guard = metrics::set_default_local_recorder(&recorder);

        let (gateway, _) = gateway();
        let connection = ConnectionId::new();
        let _outbox = gateway.connect(connection);

        gateway.handle_frame(connection, "{not json").await;
        gateway
            .handle_frame(connection, r#"{"event":"produce","data":{"classId":"c-1"}}"#)
            .await;

        let labels: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "cs_message_latency_seconds")
            .flat_map(|(key, _, _, _)| {
                key.key()
                    .labels()
                    .map(|l| l.value().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert!(labels.contains(&"unknown".to_string()), "got {labels:?}");
        assert!(labels.contains(&"produce".to_string()), "got {labels:?}");
    }

    #[tokio::test]
    async fn test_slow_collaborator_times_out_without_binding() {
        let (gateway, presence) = gateway();
        let connection = ConnectionId::new();
        let _outbox = gateway.connect(connection);

        let err = gateway
            .handle_event(
                connection,
                parse_client_frame(
                    r#"{"event":"join-room","data":{"classId":"c-1","userId":"u-1","fullName":"Ada"}}"#,
                )
                .unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CsError::Timeout(_)));
        assert!(presence.lookup_connection(connection).await.unwrap().is_none());
        assert!(presence
            .list_members(&RoomId::from("c-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unbound_connection_cannot_use_media() {
        let (gateway, _) = gateway();
        let connection = ConnectionId::new();
        let _outbox = gateway.connect(connection);

        let err = gateway
            .handle_event(
                connection,
                parse_client_frame(
                    r#"{"event":"create-transport","data":{"classId":"c-1","isProducer":true}}"#,
                )
                .unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_session_lease_waits_for_holder() {
        let (gateway, presence) = gateway();
        let gateway = Arc::new(gateway);
        let room = RoomId::from("c-1");
        let participant = ParticipantId::from("u-1");

        let held = gateway.acquire_session(&room, &participant).await.unwrap();

        let waiter = {
            let gateway = Arc::clone(&gateway);
            let (room, participant) = (room.clone(), participant.clone());
            tokio::spawn(async move { gateway.acquire_session(&room, &participant).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gateway.release_session(&held).await;
        let next = waiter.await.unwrap().unwrap();
        assert!(next.generation > held.generation);
        assert!(presence.release_lease(&next).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_lease_times_out_while_held() {
        let (gateway, presence) = gateway();
        let room = RoomId::from("c-1");
        let participant = ParticipantId::from("u-1");

        // Held by another node for longer than this gateway will wait
        let _foreign = presence
            .try_acquire_lease(&room, &participant, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let err = gateway
            .acquire_session(&room, &participant)
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::Timeout(_)));
    }
}
