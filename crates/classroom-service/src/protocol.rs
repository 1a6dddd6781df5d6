//! Signaling wire protocol.
//!
//! Every frame is a JSON text message `{"event": "<name>", "data": <payload>}`.
//! Event names are kebab-case; payload fields are camelCase except the
//! `user` object on chat broadcasts, which mirrors the backend's user record.

use crate::errors::CsError;
use crate::media::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportId, TransportInfo,
};
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Inbound
// ============================================================================

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    LeaveRoom(RoomRef),
    ChatMessage(ChatMessage),
    WebrtcOffer(Signal),
    WebrtcAnswer(Signal),
    WebrtcIceCandidate(Signal),
    GetRouterRtpCapabilities(RoomRef),
    CreateTransport(CreateTransport),
    ConnectTransport(ConnectTransport),
    Produce(Produce),
    Consume(Consume),
    ResumeConsumer(ResumeConsumer),
    CloseProducer(CloseProducer),
    SetAudioMode(SetAudioMode),
    RequestToSpeak(Relay),
    AllowToSpeak(Relay),
    DrawEvent(Relay),
    SessionStateChanged(Relay),
}

/// Inbound event names, used to label metrics and error replies.
pub const CLIENT_EVENT_NAMES: &[&str] = &[
    "join-room",
    "leave-room",
    "chat-message",
    "webrtc-offer",
    "webrtc-answer",
    "webrtc-ice-candidate",
    "get-router-rtp-capabilities",
    "create-transport",
    "connect-transport",
    "produce",
    "consume",
    "resume-consumer",
    "close-producer",
    "set-audio-mode",
    "request-to-speak",
    "allow-to-speak",
    "draw-event",
    "session-state-changed",
];

impl ClientEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::LeaveRoom(_) => "leave-room",
            ClientEvent::ChatMessage(_) => "chat-message",
            ClientEvent::WebrtcOffer(_) => "webrtc-offer",
            ClientEvent::WebrtcAnswer(_) => "webrtc-answer",
            ClientEvent::WebrtcIceCandidate(_) => "webrtc-ice-candidate",
            ClientEvent::GetRouterRtpCapabilities(_) => "get-router-rtp-capabilities",
            ClientEvent::CreateTransport(_) => "create-transport",
            ClientEvent::ConnectTransport(_) => "connect-transport",
            ClientEvent::Produce(_) => "produce",
            ClientEvent::Consume(_) => "consume",
            ClientEvent::ResumeConsumer(_) => "resume-consumer",
            ClientEvent::CloseProducer(_) => "close-producer",
            ClientEvent::SetAudioMode(_) => "set-audio-mode",
            ClientEvent::RequestToSpeak(_) => "request-to-speak",
            ClientEvent::AllowToSpeak(_) => "allow-to-speak",
            ClientEvent::DrawEvent(_) => "draw-event",
            ClientEvent::SessionStateChanged(_) => "session-state-changed",
        }
    }

    /// Room the event addresses.
    #[must_use]
    pub fn class_id(&self) -> &RoomId {
        match self {
            ClientEvent::JoinRoom(p) => &p.class_id,
            ClientEvent::LeaveRoom(p) | ClientEvent::GetRouterRtpCapabilities(p) => &p.class_id,
            ClientEvent::ChatMessage(p) => &p.class_id,
            ClientEvent::WebrtcOffer(p)
            | ClientEvent::WebrtcAnswer(p)
            | ClientEvent::WebrtcIceCandidate(p) => &p.class_id,
            ClientEvent::CreateTransport(p) => &p.class_id,
            ClientEvent::ConnectTransport(p) => &p.class_id,
            ClientEvent::Produce(p) => &p.class_id,
            ClientEvent::Consume(p) => &p.class_id,
            ClientEvent::ResumeConsumer(p) => &p.class_id,
            ClientEvent::CloseProducer(p) => &p.class_id,
            ClientEvent::SetAudioMode(p) => &p.class_id,
            ClientEvent::RequestToSpeak(p)
            | ClientEvent::AllowToSpeak(p)
            | ClientEvent::DrawEvent(p)
            | ClientEvent::SessionStateChanged(p) => &p.class_id,
        }
    }
}

/// Parse one inbound text frame.
///
/// On failure returns the event name (when it could be read) so the error
/// reply can name the request it answers.
///
/// # Errors
///
/// `CsError::Validation` for non-JSON frames, unknown events and payloads
/// that do not match the event's schema.
pub fn parse_client_frame(text: &str) -> Result<ClientEvent, (Option<&'static str>, CsError)> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| (None, CsError::Validation(format!("frame is not valid JSON: {e}"))))?;

    let name = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| (None, CsError::Validation("frame has no event name".to_string())))?;
    let known = CLIENT_EVENT_NAMES
        .iter()
        .copied()
        .find(|known| *known == name)
        .ok_or_else(|| (None, CsError::Validation(format!("unknown event: {name}"))))?;

    serde_json::from_value(value)
        .map_err(|e| (Some(known), CsError::Validation(format!("invalid {known} payload: {e}"))))
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub class_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub class_id: RoomId,
    pub user_id: ParticipantId,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub class_id: RoomId,
    pub message: String,
    pub user_id: ParticipantId,
}

/// An SDP offer/answer or ICE candidate.
///
/// The opaque body may be sent as `payload` or under the event's own key
/// (`offer`, `answer`, `candidate`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub class_id: RoomId,
    #[serde(alias = "offer", alias = "answer", alias = "candidate")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransport {
    pub class_id: RoomId,
    pub is_producer: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub class_id: RoomId,
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub class_id: RoomId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub class_id: RoomId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumer {
    pub class_id: RoomId,
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducer {
    pub class_id: RoomId,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Muted,
    Live,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAudioMode {
    pub class_id: RoomId,
    pub producer_id: ProducerId,
    pub mode: AudioMode,
}

/// Payload of relay-only events. Fields other than `classId` and `targetId`
/// are forwarded untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relay {
    pub class_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ConnectionId>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

// ============================================================================
// Outbound
// ============================================================================

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    JoinedRoom(RoomRef),
    CurrentAttendance(Vec<ParticipantId>),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    LeftRoom(RoomRef),
    ChatMessage(ChatBroadcast),
    WebrtcOffer(OfferBroadcast),
    WebrtcAnswer(AnswerBroadcast),
    WebrtcIceCandidate(CandidateBroadcast),
    RouterRtpCapabilities(RtpCapabilities),
    TransportCreated(TransportInfo),
    TransportConnected(TransportConnected),
    Produced(Produced),
    NewProducer(NewProducer),
    Consumed(Consumed),
    ConsumerResumed(ConsumerResumed),
    ProducerClosed(ProducerClosed),
    AudioModeChanged(AudioModeChanged),
    RequestToSpeak(RelayBroadcast),
    AllowToSpeak(RelayBroadcast),
    DrawEvent(RelayBroadcast),
    SessionStateChanged(RelayBroadcast),
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Serialize into a text frame.
    ///
    /// # Errors
    ///
    /// `CsError::Internal` if the payload cannot be encoded.
    pub fn to_frame(&self) -> Result<String, CsError> {
        serde_json::to_string(self)
            .map_err(|e| CsError::Internal(format!("failed to encode server event: {e}")))
    }

    /// Build the scoped error reply for a failed request.
    #[must_use]
    pub fn error(event: Option<&'static str>, err: &CsError) -> Self {
        ServerEvent::Error(ErrorPayload {
            event: event.map(str::to_string),
            code: err.error_code(),
            kind: err.error_type_label().to_string(),
            message: err.client_message(),
            retriable: err.is_retriable(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user_id: ParticipantId,
    pub full_name: String,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: ParticipantId,
    pub connection_id: ConnectionId,
}

/// Author of a chat message, in the backend's field naming.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatUser {
    pub user_id: ParticipantId,
    pub full_name: String,
}

/// A persisted chat message. `id` and `createdAt` come from the chat backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub id: String,
    pub message: String,
    pub sender_id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub user: ChatUser,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferBroadcast {
    pub offer: Value,
    pub sender_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerBroadcast {
    pub answer: Value,
    pub sender_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateBroadcast {
    pub candidate: Value,
    pub sender_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnected {
    pub transport_id: TransportId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Produced {
    pub id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub sender_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConsumerResumed {
    pub id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioModeChanged {
    pub producer_id: ProducerId,
    pub mode: AudioMode,
    pub sender_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayBroadcast {
    pub sender_id: ConnectionId,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorPayload {
    /// Request event this error answers, if it could be determined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub code: i32,
    pub kind: String,
    pub message: String,
    pub retriable: bool,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_room() {
        let frame = json!({
            "event": "join-room",
            "data": {"classId": "class-1", "userId": "u-1", "fullName": "Ada Lovelace"}
        })
        .to_string();

        let event = parse_client_frame(&frame).unwrap();
        assert_eq!(event.name(), "join-room");
        assert_eq!(event.class_id().as_str(), "class-1");
        match event {
            ClientEvent::JoinRoom(join) => {
                assert_eq!(join.user_id.as_str(), "u-1");
                assert_eq!(join.full_name, "Ada Lovelace");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_signal_accepts_event_specific_key() {
        let frame = json!({
            "event": "webrtc-offer",
            "data": {"classId": "class-1", "offer": {"type": "offer", "sdp": "v=0"}}
        })
        .to_string();

        match parse_client_frame(&frame).unwrap() {
            ClientEvent::WebrtcOffer(signal) => {
                assert_eq!(signal.payload["sdp"], "v=0");
                assert!(signal.target_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_validation_error() {
        let (name, err) = parse_client_frame(r#"{"event":"teleport","data":{}}"#).unwrap_err();
        assert!(name.is_none());
        assert!(matches!(err, CsError::Validation(_)));
    }

    #[test]
    fn test_bad_payload_reports_event_name() {
        let frame = json!({"event": "create-transport", "data": {"classId": "c"}}).to_string();
        let (name, err) = parse_client_frame(&frame).unwrap_err();
        assert_eq!(name, Some("create-transport"));
        assert!(matches!(err, CsError::Validation(_)));
    }

    #[test]
    fn test_non_json_frame_is_rejected() {
        assert!(parse_client_frame("hello").is_err());
    }

    #[test]
    fn test_event_names_match_serde_tags() {
        for name in CLIENT_EVENT_NAMES {
            let frame = json!({"event": name, "data": {}}).to_string();
            // Missing fields fail, but the tag itself must be recognised.
            if let Err((known, _)) = parse_client_frame(&frame) {
                assert_eq!(known, Some(*name));
            }
        }
    }

    #[test]
    fn test_relay_keeps_extra_fields() {
        let frame = json!({
            "event": "draw-event",
            "data": {"classId": "c", "stroke": [1, 2, 3], "color": "red"}
        })
        .to_string();

        match parse_client_frame(&frame).unwrap() {
            ClientEvent::DrawEvent(relay) => {
                assert_eq!(relay.body.len(), 2);
                assert!(!relay.body.contains_key("classId"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_server_events_use_kebab_case_tags() {
        let frame = ServerEvent::CurrentAttendance(vec![ParticipantId::from("a")])
            .to_frame()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "current-attendance");
        assert_eq!(value["data"], json!(["a"]));

        let chat = ServerEvent::ChatMessage(ChatBroadcast {
            id: "m-1".to_string(),
            message: "hi".to_string(),
            sender_id: ConnectionId::new(),
            created_at: Utc::now(),
            user: ChatUser {
                user_id: ParticipantId::from("a"),
                full_name: "Ada".to_string(),
            },
        });
        let value = serde_json::to_value(&chat).unwrap();
        assert_eq!(value["event"], "chat-message");
        assert!(value["data"].get("senderId").is_some());
        assert!(value["data"].get("createdAt").is_some());
        assert_eq!(value["data"]["user"]["user_id"], "a");
    }

    #[test]
    fn test_error_reply_hides_internal_details() {
        let err = CsError::StoreUnavailable("redis://10.0.0.1:6379 refused".to_string());
        let value = serde_json::to_value(ServerEvent::error(Some("join-room"), &err)).unwrap();

        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["event"], "join-room");
        assert_eq!(value["data"]["code"], 7);
        assert_eq!(value["data"]["retriable"], true);
        assert!(!value["data"]["message"]
            .as_str()
            .unwrap()
            .contains("10.0.0.1"));
    }
}
