//! The SFU capability the registry orchestrates.
//!
//! An engine owns the actual media objects (routers, WebRTC transports,
//! producers, consumers) and answers capability questions. It does not keep
//! room bookkeeping; that lives in [`MediaRouterRegistry`](super::MediaRouterRegistry).

use super::types::{
    ConsumerDescription, ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId,
    RtpCapabilities, RtpParameters, TransportDirection, TransportId, TransportInfo, WorkerId,
};
use crate::errors::CsError;
use async_trait::async_trait;
use thiserror::Error;

/// Forwarding priority for a producer.
///
/// Audio is forwarded ahead of video when bandwidth is constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProducerPriority(pub u8);

impl ProducerPriority {
    pub const NORMAL: ProducerPriority = ProducerPriority(1);
    pub const ELEVATED: ProducerPriority = ProducerPriority(2);

    #[must_use]
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::ELEVATED,
            MediaKind::Video => Self::NORMAL,
        }
    }
}

/// Errors reported by a media engine.
#[derive(Debug, Error)]
pub enum MediaEngineError {
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Unknown {kind}: {id}")]
    UnknownObject { kind: &'static str, id: String },

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Engine error: {0}")]
    Other(String),
}

impl From<MediaEngineError> for CsError {
    fn from(err: MediaEngineError) -> Self {
        match err {
            MediaEngineError::UnknownObject { kind, id } => {
                CsError::NotFound(format!("{kind} {id} not found"))
            }
            MediaEngineError::UnsupportedCodec(codec) => {
                CsError::Validation(format!("unsupported codec: {codec}"))
            }
            MediaEngineError::InvalidState(msg) => CsError::Conflict(msg),
            MediaEngineError::Worker(msg) | MediaEngineError::Other(msg) => CsError::Internal(msg),
        }
    }
}

/// Router/transport/producer/consumer primitives of an SFU.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self, worker: WorkerId) -> Result<RouterId, MediaEngineError>;

    async fn router_rtp_capabilities(
        &self,
        router: RouterId,
    ) -> Result<RtpCapabilities, MediaEngineError>;

    /// Close a router and everything created on it.
    async fn close_router(&self, router: RouterId) -> Result<(), MediaEngineError>;

    async fn create_webrtc_transport(
        &self,
        router: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, MediaEngineError>;

    async fn connect_transport(
        &self,
        transport: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), MediaEngineError>;

    /// Close a transport; its producers and consumers close with it.
    async fn close_transport(&self, transport: TransportId) -> Result<(), MediaEngineError>;

    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        priority: ProducerPriority,
    ) -> Result<ProducerId, MediaEngineError>;

    async fn close_producer(&self, producer: ProducerId) -> Result<(), MediaEngineError>;

    async fn pause_producer(&self, producer: ProducerId) -> Result<(), MediaEngineError>;

    async fn resume_producer(&self, producer: ProducerId) -> Result<(), MediaEngineError>;

    /// Whether a consumer with `rtp_capabilities` could receive `producer`.
    async fn can_consume(
        &self,
        router: RouterId,
        producer: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, MediaEngineError>;

    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescription, MediaEngineError>;

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), MediaEngineError>;

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), MediaEngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_is_forwarded_first() {
        assert!(
            ProducerPriority::for_kind(MediaKind::Audio)
                > ProducerPriority::for_kind(MediaKind::Video)
        );
    }

    #[test]
    fn test_engine_errors_map_to_client_categories() {
        let not_found: CsError = MediaEngineError::UnknownObject {
            kind: "transport",
            id: "t1".to_string(),
        }
        .into();
        assert!(matches!(not_found, CsError::NotFound(_)));

        let codec: CsError = MediaEngineError::UnsupportedCodec("audio/g711".to_string()).into();
        assert!(matches!(codec, CsError::Validation(_)));

        let worker: CsError = MediaEngineError::Worker("died".to_string()).into();
        assert!(matches!(worker, CsError::Internal(_)));
    }
}
