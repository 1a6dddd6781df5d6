//! Pre-configured test data.
//!
//! - RTP parameters and capabilities for the codecs the loopback engine
//!   supports
//! - DTLS parameters
//! - Signaling frame builders, one per inbound event used in tests

use classroom_service::media::{
    DtlsFingerprint, DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters,
};
use serde_json::{json, Map, Value};

/// Opus stream parameters as a browser would send them.
#[must_use]
pub fn opus_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Value::Null,
        }],
        extra: Map::new(),
    }
}

/// VP8 stream parameters.
#[must_use]
pub fn vp8_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 101,
            clock_rate: 90000,
            channels: None,
            parameters: Value::Null,
        }],
        extra: Map::new(),
    }
}

/// Receive capabilities for opus and VP8.
#[must_use]
pub fn client_rtp_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(100),
                clock_rate: 48000,
                channels: Some(2),
                parameters: Value::Null,
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90000,
                channels: None,
                parameters: Value::Null,
            },
        ],
        header_extensions: Vec::new(),
    }
}

/// Capabilities that cannot receive anything the loopback engine produces.
#[must_use]
pub fn audio_only_g711_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/PCMU".to_string(),
            preferred_payload_type: Some(0),
            clock_rate: 8000,
            channels: Some(1),
            parameters: Value::Null,
        }],
        header_extensions: Vec::new(),
    }
}

#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some("client".to_string()),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89"
                .to_string(),
        }],
    }
}

// ============================================================================
// Frames
// ============================================================================

fn frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

#[must_use]
pub fn join_frame(class_id: &str, user_id: &str, full_name: &str) -> String {
    frame(
        "join-room",
        json!({ "classId": class_id, "userId": user_id, "fullName": full_name }),
    )
}

#[must_use]
pub fn leave_frame(class_id: &str) -> String {
    frame("leave-room", json!({ "classId": class_id }))
}

#[must_use]
pub fn chat_frame(class_id: &str, user_id: &str, message: &str) -> String {
    frame(
        "chat-message",
        json!({ "classId": class_id, "userId": user_id, "message": message }),
    )
}

/// `webrtc-offer`, unicast when `target` is set.
#[must_use]
pub fn offer_frame(class_id: &str, target: Option<&str>) -> String {
    let mut data = json!({
        "classId": class_id,
        "offer": { "type": "offer", "sdp": "v=0\r\n" },
    });
    if let Some(target) = target {
        data["targetId"] = json!(target);
    }
    frame("webrtc-offer", data)
}

#[must_use]
pub fn capabilities_frame(class_id: &str) -> String {
    frame("get-router-rtp-capabilities", json!({ "classId": class_id }))
}

#[must_use]
pub fn create_transport_frame(class_id: &str, is_producer: bool) -> String {
    frame(
        "create-transport",
        json!({ "classId": class_id, "isProducer": is_producer }),
    )
}

#[must_use]
pub fn connect_transport_frame(class_id: &str, transport_id: &str) -> String {
    frame(
        "connect-transport",
        json!({
            "classId": class_id,
            "transportId": transport_id,
            "dtlsParameters": client_dtls_parameters(),
        }),
    )
}

#[must_use]
pub fn produce_audio_frame(class_id: &str, transport_id: &str) -> String {
    frame(
        "produce",
        json!({
            "classId": class_id,
            "transportId": transport_id,
            "kind": "audio",
            "rtpParameters": opus_rtp_parameters(),
        }),
    )
}

#[must_use]
pub fn consume_frame(
    class_id: &str,
    transport_id: &str,
    producer_id: &str,
    capabilities: &RtpCapabilities,
) -> String {
    frame(
        "consume",
        json!({
            "classId": class_id,
            "transportId": transport_id,
            "producerId": producer_id,
            "rtpCapabilities": capabilities,
        }),
    )
}

#[must_use]
pub fn relay_frame(event: &str, class_id: &str, target: Option<&str>, body: Value) -> String {
    let mut data = match body {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    data.insert("classId".to_string(), json!(class_id));
    if let Some(target) = target {
        data.insert("targetId".to_string(), json!(target));
    }
    frame(event, Value::Object(data))
}
