//! SFU orchestration.
//!
//! - [`MediaEngine`] is the SFU capability: routers, WebRTC transports,
//!   producers, consumers and capability checks.
//! - [`MediaRouterRegistry`] owns one router per room and the
//!   transport/producer/consumer handles created on it, reachable only
//!   through its synchronized API.
//! - [`WorkerPool`] spreads routers over media workers.
//! - [`spawn_room_sweeper`] tears down rooms that stayed idle too long.

mod engine;
mod loopback;
mod registry;
mod sweeper;
mod types;
mod workers;

pub use engine::{MediaEngine, MediaEngineError, ProducerPriority};
pub use loopback::{default_media_codecs, LoopbackMediaEngine};
pub use registry::{MediaRouterRegistry, ReleasedMedia};
pub use sweeper::spawn_room_sweeper;
pub use types::{
    ConsumerDescription, ConsumerId, DtlsFingerprint, DtlsParameters, IceCandidate,
    IceParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportDirection, TransportId, TransportInfo, WorkerId,
};
pub use workers::WorkerPool;
