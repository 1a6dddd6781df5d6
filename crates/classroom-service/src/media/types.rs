//! Media identifiers and the negotiation payloads exchanged with clients.
//!
//! Field names follow the WebRTC client libraries (camelCase), so these
//! structs serialize straight into signaling frames.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! media_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

media_id!(
    /// Router identifier, one per active room.
    RouterId
);
media_id!(TransportId);
media_id!(ProducerId);
media_id!(ConsumerId);

/// Index of a media worker in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Direction of a WebRTC transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    /// Client sends media (`isProducer: true`).
    Send,
    /// Client receives media.
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub fn from_is_producer(is_producer: bool) -> Self {
        if is_producer {
            TransportDirection::Send
        } else {
            TransportDirection::Recv
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// A codec a router or endpoint is able to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

impl RtpCodecCapability {
    /// Two codecs match when MIME type (case-insensitive) and clock rate agree.
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type) && self.clock_rate == clock_rate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

/// A codec as actually negotiated for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Stream parameters sent by a producing client.
///
/// Only `mid` and `codecs` are inspected; encodings, header extensions and
/// RTCP settings are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Transport parameters returned to the client after `create-transport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// A consumer as created by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescription {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
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
    fn test_transport_info_uses_client_field_names() {
        let info = TransportInfo {
            id: TransportId::new(),
            ice_parameters: IceParameters {
                username_fragment: "ufrag".to_string(),
                password: "pwd".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: "127.0.0.1".to_string(),
                protocol: "udp".to_string(),
                port: 40000,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![],
            },
        };

        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("iceParameters").is_some());
        assert_eq!(value["iceParameters"]["usernameFragment"], "ufrag");
        assert_eq!(value["iceCandidates"][0]["type"], "host");
        assert_eq!(value["dtlsParameters"]["role"], "auto");
    }

    #[test]
    fn test_rtp_parameters_keep_unknown_fields() {
        let raw = json!({
            "mid": "0",
            "codecs": [{"mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2}],
            "encodings": [{"ssrc": 1234}],
            "rtcp": {"cname": "abc"}
        });

        let params: RtpParameters = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.extra.len(), 2);
        assert_eq!(serde_json::to_value(&params).unwrap(), raw);
    }

    #[test]
    fn test_codec_match_ignores_mime_case() {
        let codec = RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Value::Null,
        };
        assert!(codec.matches("video/vp8", 90000));
        assert!(!codec.matches("video/vp8", 48000));
        assert!(!codec.matches("video/h264", 90000));
    }

    #[test]
    fn test_transport_direction_from_flag() {
        assert_eq!(TransportDirection::from_is_producer(true), TransportDirection::Send);
        assert_eq!(TransportDirection::from_is_producer(false), TransportDirection::Recv);
    }
}
