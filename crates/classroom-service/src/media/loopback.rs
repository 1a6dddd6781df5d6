//! In-process media engine.
//!
//! Implements the SFU primitives without forwarding any packets: it allocates
//! ids, generates ICE/DTLS parameters, tracks object lifecycles and performs
//! codec capability matching. Used for single-node development and tests.

use super::engine::{MediaEngine, MediaEngineError, ProducerPriority};
use super::types::{
    ConsumerDescription, ConsumerId, DtlsFingerprint, DtlsParameters, IceCandidate,
    IceParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportDirection, TransportId, TransportInfo, WorkerId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// First port handed out to transports.
pub const PORT_RANGE_START: u16 = 40000;

/// Last port handed out before wrapping.
pub const PORT_RANGE_END: u16 = 49999;

/// Codecs every loopback router supports.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(100),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Value::Null,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(101),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Value::Null,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: Some(102),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1
            }),
        },
    ]
}

struct RouterState {
    worker: WorkerId,
    capabilities: RtpCapabilities,
}

struct TransportState {
    router: RouterId,
    direction: TransportDirection,
    connected: bool,
}

struct ProducerState {
    router: RouterId,
    transport: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    priority: ProducerPriority,
    paused: bool,
}

struct ConsumerState {
    transport: TransportId,
    producer: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct Objects {
    routers: HashMap<RouterId, RouterState>,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    next_port: u16,
}

impl Objects {
    fn allocate_port(&mut self) -> u16 {
        if self.next_port < PORT_RANGE_START || self.next_port > PORT_RANGE_END {
            self.next_port = PORT_RANGE_START;
        }
        let port = self.next_port;
        self.next_port = self.next_port.saturating_add(1);
        port
    }

    fn remove_transport_cascade(&mut self, transport: TransportId) {
        self.transports.remove(&transport);
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport == transport)
            .map(|(id, _)| *id)
            .collect();
        for producer in producers {
            self.remove_producer_cascade(producer);
        }
        self.consumers.retain(|_, c| c.transport != transport);
    }

    fn remove_producer_cascade(&mut self, producer: ProducerId) {
        self.producers.remove(&producer);
        self.consumers.retain(|_, c| c.producer != producer);
    }
}

fn unknown(kind: &'static str, id: impl ToString) -> MediaEngineError {
    MediaEngineError::UnknownObject {
        kind,
        id: id.to_string(),
    }
}

fn fingerprint() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

/// Loopback [`MediaEngine`].
pub struct LoopbackMediaEngine {
    announced_ip: String,
    codecs: Vec<RtpCodecCapability>,
    objects: Mutex<Objects>,
}

impl LoopbackMediaEngine {
    /// Create an engine whose routers support [`default_media_codecs`].
    #[must_use]
    pub fn new(announced_ip: impl Into<String>) -> Self {
        Self::with_codecs(announced_ip, default_media_codecs())
    }

    #[must_use]
    pub fn with_codecs(announced_ip: impl Into<String>, codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            announced_ip: announced_ip.into(),
            codecs,
            objects: Mutex::new(Objects::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live routers.
    #[must_use]
    pub fn router_count(&self) -> usize {
        self.lock().routers.len()
    }

    /// Number of live consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Forwarding priority of a live producer.
    #[must_use]
    pub fn producer_priority(&self, producer: ProducerId) -> Option<ProducerPriority> {
        self.lock().producers.get(&producer).map(|p| p.priority)
    }

    /// Whether a live producer is paused.
    #[must_use]
    pub fn producer_paused(&self, producer: ProducerId) -> Option<bool> {
        self.lock().producers.get(&producer).map(|p| p.paused)
    }

    /// Whether a live consumer is paused.
    #[must_use]
    pub fn consumer_paused(&self, consumer: ConsumerId) -> Option<bool> {
        self.lock().consumers.get(&consumer).map(|c| c.paused)
    }

    /// Worker a live router was created on.
    #[must_use]
    pub fn router_worker(&self, router: RouterId) -> Option<WorkerId> {
        self.lock().routers.get(&router).map(|r| r.worker)
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn create_router(&self, worker: WorkerId) -> Result<RouterId, MediaEngineError> {
        let id = RouterId::new();
        self.lock().routers.insert(
            id,
            RouterState {
                worker,
                capabilities: RtpCapabilities {
                    codecs: self.codecs.clone(),
                    header_extensions: Vec::new(),
                },
            },
        );
        debug!(target: "cs.media", router_id = %id, %worker, "Loopback router created");
        Ok(id)
    }

    async fn router_rtp_capabilities(
        &self,
        router: RouterId,
    ) -> Result<RtpCapabilities, MediaEngineError> {
        self.lock()
            .routers
            .get(&router)
            .map(|r| r.capabilities.clone())
            .ok_or_else(|| unknown("router", router))
    }

    async fn close_router(&self, router: RouterId) -> Result<(), MediaEngineError> {
        let mut objects = self.lock();
        if objects.routers.remove(&router).is_none() {
            return Err(unknown("router", router));
        }
        let transports: Vec<TransportId> = objects
            .transports
            .iter()
            .filter(|(_, t)| t.router == router)
            .map(|(id, _)| *id)
            .collect();
        for transport in transports {
            objects.remove_transport_cascade(transport);
        }
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, MediaEngineError> {
        let mut objects = self.lock();
        if !objects.routers.contains_key(&router) {
            return Err(unknown("router", router));
        }

        let id = TransportId::new();
        let port = objects.allocate_port();
        objects.transports.insert(
            id,
            TransportState {
                router,
                direction,
                connected: false,
            },
        );

        let simple = id.0.simple().to_string();
        Ok(TransportInfo {
            id,
            ice_parameters: IceParameters {
                username_fragment: simple.chars().take(16).collect(),
                password: simple,
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.announced_ip.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint(),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), MediaEngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(MediaEngineError::Other(
                "dtls parameters carry no fingerprint".to_string(),
            ));
        }
        let mut objects = self.lock();
        let state = objects
            .transports
            .get_mut(&transport)
            .ok_or_else(|| unknown("transport", transport))?;
        if state.connected {
            return Err(MediaEngineError::InvalidState(format!(
                "transport {transport} already connected"
            )));
        }
        state.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport: TransportId) -> Result<(), MediaEngineError> {
        let mut objects = self.lock();
        if !objects.transports.contains_key(&transport) {
            return Err(unknown("transport", transport));
        }
        objects.remove_transport_cascade(transport);
        Ok(())
    }

    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        priority: ProducerPriority,
    ) -> Result<ProducerId, MediaEngineError> {
        let mut objects = self.lock();
        let state = objects
            .transports
            .get(&transport)
            .ok_or_else(|| unknown("transport", transport))?;
        if state.direction != TransportDirection::Send {
            return Err(MediaEngineError::InvalidState(format!(
                "transport {transport} is not a send transport"
            )));
        }
        let router = state.router;
        let capabilities = objects
            .routers
            .get(&router)
            .map(|r| &r.capabilities)
            .ok_or_else(|| unknown("router", router))?;

        if rtp_parameters.codecs.is_empty() {
            return Err(MediaEngineError::UnsupportedCodec(
                "no codecs in rtp parameters".to_string(),
            ));
        }
        for codec in &rtp_parameters.codecs {
            let supported = capabilities
                .codecs
                .iter()
                .any(|c| c.kind == kind && c.matches(&codec.mime_type, codec.clock_rate));
            if !supported {
                return Err(MediaEngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }

        let id = ProducerId::new();
        objects.producers.insert(
            id,
            ProducerState {
                router,
                transport,
                kind,
                rtp_parameters,
                priority,
                paused: false,
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer: ProducerId) -> Result<(), MediaEngineError> {
        let mut objects = self.lock();
        if !objects.producers.contains_key(&producer) {
            return Err(unknown("producer", producer));
        }
        objects.remove_producer_cascade(producer);
        Ok(())
    }

    async fn pause_producer(&self, producer: ProducerId) -> Result<(), MediaEngineError> {
        let mut objects = self.lock();
        let state = objects
            .producers
            .get_mut(&producer)
            .ok_or_else(|| unknown("producer", producer))?;
        state.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer: ProducerId) -> Result<(), MediaEngineError> {
        let mut objects = self.lock();
        let state = objects
            .producers
            .get_mut(&producer)
            .ok_or_else(|| unknown("producer", producer))?;
        state.paused = false;
        Ok(())
    }

    async fn can_consume(
        &self,
        router: RouterId,
        producer: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, MediaEngineError> {
        let objects = self.lock();
        if !objects.routers.contains_key(&router) {
            return Err(unknown("router", router));
        }
        let Some(state) = objects.producers.get(&producer) else {
            return Err(unknown("producer", producer));
        };
        if state.router != router {
            return Ok(false);
        }
        Ok(state.rtp_parameters.codecs.iter().any(|codec| {
            rtp_capabilities
                .codecs
                .iter()
                .any(|c| c.kind == state.kind && c.matches(&codec.mime_type, codec.clock_rate))
        }))
    }

    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerDescription, MediaEngineError> {
        let mut objects = self.lock();
        let transport_state = objects
            .transports
            .get(&transport)
            .ok_or_else(|| unknown("transport", transport))?;
        if transport_state.direction != TransportDirection::Recv {
            return Err(MediaEngineError::InvalidState(format!(
                "transport {transport} is not a receive transport"
            )));
        }
        let router = transport_state.router;
        let producer_state = objects
            .producers
            .get(&producer)
            .ok_or_else(|| unknown("producer", producer))?;
        if producer_state.router != router {
            return Err(unknown("producer", producer));
        }

        let mut rtp_parameters = producer_state.rtp_parameters.clone();
        rtp_parameters.codecs.retain(|codec| {
            rtp_capabilities
                .codecs
                .iter()
                .any(|c| c.matches(&codec.mime_type, codec.clock_rate))
        });
        if rtp_parameters.codecs.is_empty() {
            return Err(MediaEngineError::UnsupportedCodec(
                "no common codec with consumer capabilities".to_string(),
            ));
        }
        let kind = producer_state.kind;

        let id = ConsumerId::new();
        rtp_parameters.mid = Some(objects.consumers.len().to_string());
        objects.consumers.insert(
            id,
            ConsumerState {
                transport,
                producer,
                paused,
            },
        );

        Ok(ConsumerDescription {
            id,
            producer_id: producer,
            kind,
            rtp_parameters,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), MediaEngineError> {
        let mut objects = self.lock();
        let state = objects
            .consumers
            .get_mut(&consumer)
            .ok_or_else(|| unknown("consumer", consumer))?;
        state.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), MediaEngineError> {
        self.lock()
            .consumers
            .remove(&consumer)
            .map(|_| ())
            .ok_or_else(|| unknown("consumer", consumer))
    }
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
    use crate::media::types::RtpCodecParameters;

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Value::Null,
            }],
            extra: serde_json::Map::new(),
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some("client".to_string()),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint(),
            }],
        }
    }

    #[tokio::test]
    async fn test_transport_parameters_are_generated() {
        let engine = LoopbackMediaEngine::new("10.0.0.5");
        let router = engine.create_router(WorkerId(0)).await.unwrap();

        let info = engine
            .create_webrtc_transport(router, TransportDirection::Send)
            .await
            .unwrap();

        assert_eq!(info.ice_candidates.len(), 1);
        assert_eq!(info.ice_candidates[0].ip, "10.0.0.5");
        assert!(info.ice_candidates[0].port >= PORT_RANGE_START);
        assert_eq!(info.dtls_parameters.fingerprints[0].value.len(), 47);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let engine = LoopbackMediaEngine::new("127.0.0.1");
        let router = engine.create_router(WorkerId(0)).await.unwrap();
        let info = engine
            .create_webrtc_transport(router, TransportDirection::Send)
            .await
            .unwrap();

        engine.connect_transport(info.id, dtls()).await.unwrap();
        let second = engine.connect_transport(info.id, dtls()).await;
        assert!(matches!(second, Err(MediaEngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let engine = LoopbackMediaEngine::new("127.0.0.1");
        let router = engine.create_router(WorkerId(0)).await.unwrap();
        let send = engine
            .create_webrtc_transport(router, TransportDirection::Send)
            .await
            .unwrap();

        let mut params = opus_parameters();
        params.codecs[0].mime_type = "audio/PCMU".to_string();
        params.codecs[0].clock_rate = 8000;

        let result = engine
            .produce(send.id, MediaKind::Audio, params, ProducerPriority::ELEVATED)
            .await;
        assert!(matches!(result, Err(MediaEngineError::UnsupportedCodec(_))));
    }

    #[tokio::test]
    async fn test_closing_transport_cascades() {
        let engine = LoopbackMediaEngine::new("127.0.0.1");
        let router = engine.create_router(WorkerId(0)).await.unwrap();
        let send = engine
            .create_webrtc_transport(router, TransportDirection::Send)
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(router, TransportDirection::Recv)
            .await
            .unwrap();

        let producer = engine
            .produce(
                send.id,
                MediaKind::Audio,
                opus_parameters(),
                ProducerPriority::ELEVATED,
            )
            .await
            .unwrap();
        let capabilities = engine.router_rtp_capabilities(router).await.unwrap();
        engine
            .consume(recv.id, producer, capabilities, true)
            .await
            .unwrap();
        assert_eq!(engine.consumer_count(), 1);

        engine.close_transport(send.id).await.unwrap();

        assert!(engine.producer_priority(producer).is_none());
        assert_eq!(engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_can_consume_requires_common_codec() {
        let engine = LoopbackMediaEngine::new("127.0.0.1");
        let router = engine.create_router(WorkerId(0)).await.unwrap();
        let send = engine
            .create_webrtc_transport(router, TransportDirection::Send)
            .await
            .unwrap();
        let producer = engine
            .produce(
                send.id,
                MediaKind::Audio,
                opus_parameters(),
                ProducerPriority::ELEVATED,
            )
            .await
            .unwrap();

        let full = engine.router_rtp_capabilities(router).await.unwrap();
        assert!(engine.can_consume(router, producer, &full).await.unwrap());

        let video_only = RtpCapabilities {
            codecs: full
                .codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Video)
                .cloned()
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(!engine
            .can_consume(router, producer, &video_only)
            .await
            .unwrap());
    }
}
