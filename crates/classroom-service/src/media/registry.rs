//! Media Router Registry.
//!
//! Owns the per-room media bookkeeping: one lazily created router per room,
//! plus the transports, producers and consumers created on it and the
//! connection that owns each of them. Media handles are process-local; a
//! participant's media session is pinned to the node that created its
//! transports.
//!
//! # Locking
//!
//! - `rooms` (map lock) is held only to look up, insert or evict entries.
//! - Each room's `state` lock guards its object maps and is never held across
//!   an engine call. Lock order is map lock, then room lock.
//! - Router creation is serialized per room through a `OnceCell`, so N
//!   concurrent first-joins create exactly one router.
//!
//! Because locks are released around engine calls, every mutation re-checks
//! that the objects it depends on still exist once the call returns, and
//! undoes the engine side effect if they were torn down in the meantime.

use super::engine::{MediaEngine, MediaEngineError, ProducerPriority};
use super::types::{
    ConsumerDescription, ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId,
    RtpCapabilities, RtpParameters, TransportDirection, TransportId, TransportInfo, WorkerId,
};
use super::workers::WorkerPool;
use crate::errors::CsError;
use crate::observability::metrics::{
    record_media_call_latency, record_rooms_evicted, set_rooms_active,
};
use common::types::{ConnectionId, RoomId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy)]
struct RouterHandle {
    id: RouterId,
    worker: WorkerId,
}

/// Transport lifecycle. `Connecting` marks an in-flight DTLS exchange so a
/// second connect is refused without holding the lock across the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Created,
    Connecting,
    Connected,
}

struct TransportEntry {
    owner: ConnectionId,
    direction: TransportDirection,
    state: TransportState,
}

struct ProducerEntry {
    owner: ConnectionId,
    transport: TransportId,
    kind: MediaKind,
    paused: bool,
}

struct ConsumerEntry {
    owner: ConnectionId,
    transport: TransportId,
    producer: ProducerId,
    paused: bool,
}

struct RoomMediaState {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    occupants: HashSet<ConnectionId>,
    idle_since: Option<Instant>,
    closed: bool,
}

impl RoomMediaState {
    fn new() -> Self {
        Self {
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            occupants: HashSet::new(),
            idle_since: Some(Instant::now()),
            closed: false,
        }
    }

    fn owned_transport(
        &self,
        transport: TransportId,
        owner: ConnectionId,
    ) -> Result<&TransportEntry, CsError> {
        self.transports
            .get(&transport)
            .filter(|t| t.owner == owner)
            .ok_or_else(|| CsError::NotFound(format!("transport {transport} not found")))
    }

    /// Drop a producer and every consumer of it.
    fn remove_producer(&mut self, producer: ProducerId) -> Option<ProducerEntry> {
        let entry = self.producers.remove(&producer)?;
        self.consumers.retain(|_, c| c.producer != producer);
        Some(entry)
    }
}

struct RoomMedia {
    router: OnceCell<RouterHandle>,
    state: Mutex<RoomMediaState>,
}

impl RoomMedia {
    fn new() -> Self {
        Self {
            router: OnceCell::new(),
            state: Mutex::new(RoomMediaState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoomMediaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn router(&self, room: &RoomId) -> Result<RouterHandle, CsError> {
        self.router
            .get()
            .copied()
            .ok_or_else(|| CsError::NotFound(format!("no router for room {room}")))
    }
}

/// Media released when a connection leaves a room.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleasedMedia {
    pub transports: Vec<TransportId>,
    /// Producers the connection owned; peers must be told they are gone.
    pub producers: Vec<ProducerId>,
    pub consumers: usize,
}

pub struct MediaRouterRegistry {
    engine: Arc<dyn MediaEngine>,
    workers: WorkerPool,
    rooms: Mutex<HashMap<RoomId, Arc<RoomMedia>>>,
    call_timeout: Duration,
}

impl MediaRouterRegistry {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, workers: WorkerPool, call_timeout: Duration) -> Self {
        Self {
            engine,
            workers,
            rooms: Mutex::new(HashMap::new()),
            call_timeout,
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, Arc<RoomMedia>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn room(&self, room: &RoomId) -> Result<Arc<RoomMedia>, CsError> {
        self.rooms()
            .get(room)
            .cloned()
            .ok_or_else(|| CsError::NotFound(format!("room {room} has no media session")))
    }

    /// Run one engine call under the call timeout and record its latency.
    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, CsError>
    where
        F: Future<Output = Result<T, MediaEngineError>>,
    {
        let start = Instant::now();
        let result = tokio::time::timeout(self.call_timeout, call).await;
        record_media_call_latency(operation, start.elapsed());

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(target: "cs.media", operation, error = %e, "Media engine call failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(target: "cs.media", operation, "Media engine call timed out");
                Err(CsError::Timeout(format!("media {operation} timed out")))
            }
        }
    }

    /// Get the room's router, creating it on first use.
    ///
    /// Idempotent: concurrent callers for the same room share one router.
    #[instrument(skip_all, fields(room = %room))]
    pub async fn get_or_create_router(&self, room: &RoomId) -> Result<RouterId, CsError> {
        let media = {
            let mut rooms = self.rooms();
            let entry = rooms.entry(room.clone()).or_insert_with(|| Arc::new(RoomMedia::new()));
            Arc::clone(entry)
        };
        self.ensure_router(room, &media).await
    }

    async fn ensure_router(&self, room: &RoomId, media: &RoomMedia) -> Result<RouterId, CsError> {
        let handle = media
            .router
            .get_or_try_init(|| async {
                let worker = self.workers.acquire();
                match self
                    .call("create_router", self.engine.create_router(worker))
                    .await
                {
                    Ok(id) => {
                        info!(target: "cs.media", room = %room, router_id = %id, %worker, "Router created");
                        Ok(RouterHandle { id, worker })
                    }
                    Err(e) => {
                        self.workers.release(worker);
                        Err(e)
                    }
                }
            })
            .await?;
        let handle = *handle;

        let closed = media.lock().closed;
        if closed {
            // Evicted while the router was being created.
            self.close_router(handle).await;
            return Err(CsError::NotFound(format!("room {room} was closed")));
        }

        set_rooms_active(self.room_count());
        Ok(handle.id)
    }

    /// Register `connection` as present in the room's media session and
    /// make sure the router exists. Clears any idle mark.
    #[instrument(skip_all, fields(room = %room, connection_id = %connection))]
    pub async fn enter(&self, room: &RoomId, connection: ConnectionId) -> Result<RouterId, CsError> {
        let media = {
            let mut rooms = self.rooms();
            let entry = rooms.entry(room.clone()).or_insert_with(|| Arc::new(RoomMedia::new()));
            let mut state = entry.lock();
            state.occupants.insert(connection);
            state.idle_since = None;
            drop(state);
            Arc::clone(entry)
        };

        match self.ensure_router(room, &media).await {
            Ok(id) => Ok(id),
            Err(e) => {
                let mut state = media.lock();
                state.occupants.remove(&connection);
                if state.occupants.is_empty() && state.idle_since.is_none() {
                    state.idle_since = Some(Instant::now());
                }
                Err(e)
            }
        }
    }

    /// RTP capabilities of the room's router.
    pub async fn router_rtp_capabilities(&self, room: &RoomId) -> Result<RtpCapabilities, CsError> {
        let router = self.room(room)?.router(room)?;
        self.call(
            "router_rtp_capabilities",
            self.engine.router_rtp_capabilities(router.id),
        )
        .await
    }

    /// Create a WebRTC transport owned by `connection`.
    #[instrument(skip_all, fields(room = %room, connection_id = %connection))]
    pub async fn create_transport(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, CsError> {
        let media = self.room(room)?;
        let router = media.router(room)?;

        let info = self
            .call(
                "create_transport",
                self.engine.create_webrtc_transport(router.id, direction),
            )
            .await?;

        let inserted = {
            let mut state = media.lock();
            if state.closed || !state.occupants.contains(&connection) {
                false
            } else {
                state.transports.insert(
                    info.id,
                    TransportEntry {
                        owner: connection,
                        direction,
                        state: TransportState::Created,
                    },
                );
                true
            }
        };

        if !inserted {
            self.discard("close_transport", self.engine.close_transport(info.id))
                .await;
            return Err(CsError::NotFound(format!(
                "connection is not in the media session of room {room}"
            )));
        }

        debug!(target: "cs.media", room = %room, transport_id = %info.id, ?direction, "Transport created");
        Ok(info)
    }

    /// Complete the DTLS exchange for a transport. A transport connects once.
    #[instrument(skip_all, fields(room = %room, transport_id = %transport))]
    pub async fn connect_transport(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        transport: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), CsError> {
        let media = self.room(room)?;
        {
            let mut state = media.lock();
            state.owned_transport(transport, connection)?;
            let entry = state.transports.get_mut(&transport).ok_or_else(|| {
                CsError::NotFound(format!("transport {transport} not found"))
            })?;
            if entry.state != TransportState::Created {
                return Err(CsError::Conflict(format!(
                    "transport {transport} is already connected"
                )));
            }
            entry.state = TransportState::Connecting;
        }

        let result = self
            .call(
                "connect_transport",
                self.engine.connect_transport(transport, dtls_parameters),
            )
            .await;

        let mut state = media.lock();
        let Some(entry) = state.transports.get_mut(&transport) else {
            return Err(CsError::NotFound(format!("transport {transport} not found")));
        };
        match result {
            Ok(()) => {
                entry.state = TransportState::Connected;
                Ok(())
            }
            Err(e) => {
                entry.state = TransportState::Created;
                Err(e)
            }
        }
    }

    /// Create a producer on a send transport. Audio gets elevated priority.
    #[instrument(skip_all, fields(room = %room, transport_id = %transport, kind = kind.as_str()))]
    pub async fn produce(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, CsError> {
        let media = self.room(room)?;
        {
            let state = media.lock();
            let entry = state.owned_transport(transport, connection)?;
            if entry.direction != TransportDirection::Send {
                return Err(CsError::Validation(
                    "cannot produce on a receive transport".to_string(),
                ));
            }
        }

        let priority = ProducerPriority::for_kind(kind);
        let producer = self
            .call(
                "produce",
                self.engine
                    .produce(transport, kind, rtp_parameters, priority),
            )
            .await?;

        let inserted = {
            let mut state = media.lock();
            if state.transports.contains_key(&transport) {
                state.producers.insert(
                    producer,
                    ProducerEntry {
                        owner: connection,
                        transport,
                        kind,
                        paused: false,
                    },
                );
                true
            } else {
                false
            }
        };

        if !inserted {
            self.discard("close_producer", self.engine.close_producer(producer))
                .await;
            return Err(CsError::NotFound(format!("transport {transport} not found")));
        }

        info!(target: "cs.media", room = %room, producer_id = %producer, priority = priority.0, "Producer created");
        Ok(producer)
    }

    /// Create a paused consumer of `producer` on a receive transport.
    ///
    /// # Errors
    ///
    /// `IncompatibleCapabilities` when the router says the capabilities cannot
    /// receive the producer; no consumer is created in that case.
    #[instrument(skip_all, fields(room = %room, transport_id = %transport, producer_id = %producer))]
    pub async fn consume(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        transport: TransportId,
        producer: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescription, CsError> {
        let media = self.room(room)?;
        let router = media.router(room)?;
        {
            let state = media.lock();
            let entry = state.owned_transport(transport, connection)?;
            if entry.direction != TransportDirection::Recv {
                return Err(CsError::Validation(
                    "cannot consume on a send transport".to_string(),
                ));
            }
            if !state.producers.contains_key(&producer) {
                return Err(CsError::NotFound(format!("producer {producer} not found")));
            }
        }

        let compatible = self
            .call(
                "can_consume",
                self.engine.can_consume(router.id, producer, &rtp_capabilities),
            )
            .await?;
        if !compatible {
            return Err(CsError::IncompatibleCapabilities(format!(
                "capabilities cannot receive producer {producer}"
            )));
        }

        let consumer = self
            .call(
                "consume",
                self.engine.consume(transport, producer, rtp_capabilities, true),
            )
            .await?;

        let inserted = {
            let mut state = media.lock();
            if state.transports.contains_key(&transport) && state.producers.contains_key(&producer)
            {
                state.consumers.insert(
                    consumer.id,
                    ConsumerEntry {
                        owner: connection,
                        transport,
                        producer,
                        paused: consumer.paused,
                    },
                );
                true
            } else {
                false
            }
        };

        if !inserted {
            self.discard("close_consumer", self.engine.close_consumer(consumer.id))
                .await;
            return Err(CsError::NotFound(format!("producer {producer} not found")));
        }

        Ok(consumer)
    }

    /// Resume a consumer owned by `connection`.
    pub async fn resume_consumer(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        consumer: ConsumerId,
    ) -> Result<(), CsError> {
        let media = self.room(room)?;
        {
            let state = media.lock();
            if !state
                .consumers
                .get(&consumer)
                .is_some_and(|c| c.owner == connection)
            {
                return Err(CsError::NotFound(format!("consumer {consumer} not found")));
            }
        }

        self.call("resume_consumer", self.engine.resume_consumer(consumer))
            .await?;

        if let Some(entry) = media.lock().consumers.get_mut(&consumer) {
            entry.paused = false;
        }
        Ok(())
    }

    /// Pause or resume a producer owned by `connection`. Returns its kind.
    pub async fn set_producer_paused(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        producer: ProducerId,
        paused: bool,
    ) -> Result<MediaKind, CsError> {
        let media = self.room(room)?;
        let kind = {
            let state = media.lock();
            state
                .producers
                .get(&producer)
                .filter(|p| p.owner == connection)
                .map(|p| p.kind)
                .ok_or_else(|| CsError::NotFound(format!("producer {producer} not found")))?
        };

        if paused {
            self.call("pause_producer", self.engine.pause_producer(producer))
                .await?;
        } else {
            self.call("resume_producer", self.engine.resume_producer(producer))
                .await?;
        }

        if let Some(entry) = media.lock().producers.get_mut(&producer) {
            entry.paused = paused;
        }
        Ok(kind)
    }

    /// Close a producer owned by `connection`; its consumers close with it.
    #[instrument(skip_all, fields(room = %room, producer_id = %producer))]
    pub async fn close_producer(
        &self,
        room: &RoomId,
        connection: ConnectionId,
        producer: ProducerId,
    ) -> Result<(), CsError> {
        let media = self.room(room)?;
        {
            let mut state = media.lock();
            if !state
                .producers
                .get(&producer)
                .is_some_and(|p| p.owner == connection)
            {
                return Err(CsError::NotFound(format!("producer {producer} not found")));
            }
            state.remove_producer(producer);
        }

        self.discard("close_producer", self.engine.close_producer(producer))
            .await;
        Ok(())
    }

    /// Release everything `connection` owns in the room.
    ///
    /// Closing a transport closes the producers and consumers on it, and
    /// closing a producer closes every consumer of it, including consumers
    /// owned by other connections. Marks the room idle once no occupants
    /// remain. Calling this for a connection that owns nothing is a no-op.
    #[instrument(skip_all, fields(room = %room, connection_id = %connection))]
    pub async fn release_connection(&self, room: &RoomId, connection: ConnectionId) -> ReleasedMedia {
        let Ok(media) = self.room(room) else {
            return ReleasedMedia::default();
        };

        let released = {
            let mut state = media.lock();
            state.occupants.remove(&connection);
            if state.occupants.is_empty() && state.idle_since.is_none() {
                state.idle_since = Some(Instant::now());
            }
            let consumers_before = state.consumers.len();

            let transports: Vec<TransportId> = state
                .transports
                .iter()
                .filter(|(_, t)| t.owner == connection)
                .map(|(id, _)| *id)
                .collect();
            for transport in &transports {
                state.transports.remove(transport);
            }

            let producers: Vec<ProducerId> = state
                .producers
                .iter()
                .filter(|(_, p)| p.owner == connection || transports.contains(&p.transport))
                .map(|(id, _)| *id)
                .collect();
            for producer in &producers {
                state.remove_producer(*producer);
            }

            state
                .consumers
                .retain(|_, c| c.owner != connection && !transports.contains(&c.transport));
            let consumers = consumers_before - state.consumers.len();

            ReleasedMedia {
                transports,
                producers,
                consumers,
            }
        };

        for transport in &released.transports {
            self.discard("close_transport", self.engine.close_transport(*transport))
                .await;
        }

        if !released.transports.is_empty() {
            info!(
                target: "cs.media",
                room = %room,
                transports = released.transports.len(),
                producers = released.producers.len(),
                "Released connection media"
            );
        }
        released
    }

    /// Tear down rooms idle for at least `idle_for` with no live transports.
    /// Returns the number of rooms evicted.
    pub async fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<(RoomId, Arc<RoomMedia>)> = {
            let mut rooms = self.rooms();
            let expired: Vec<RoomId> = rooms
                .iter()
                .filter(|(_, media)| {
                    let state = media.lock();
                    state.occupants.is_empty()
                        && state.transports.is_empty()
                        && state
                            .idle_since
                            .is_some_and(|since| now.duration_since(since) >= idle_for)
                })
                .map(|(room, _)| room.clone())
                .collect();

            expired
                .into_iter()
                .filter_map(|room| {
                    let media = rooms.remove(&room)?;
                    media.lock().closed = true;
                    Some((room, media))
                })
                .collect()
        };

        for (room, media) in &evicted {
            if let Some(handle) = media.router.get() {
                self.close_router(*handle).await;
            }
            info!(target: "cs.media", room = %room, "Idle room evicted");
        }

        if !evicted.is_empty() {
            record_rooms_evicted(evicted.len());
            set_rooms_active(self.room_count());
        }
        evicted.len()
    }

    async fn close_router(&self, handle: RouterHandle) {
        self.discard("close_router", self.engine.close_router(handle.id))
            .await;
        self.workers.release(handle.worker);
    }

    /// Run a best-effort cleanup call; failures are logged and dropped.
    async fn discard<F>(&self, operation: &'static str, call: F)
    where
        F: Future<Output = Result<(), MediaEngineError>>,
    {
        if let Err(e) = self.call(operation, call).await {
            warn!(target: "cs.media", operation, error = %e, "Media cleanup failed");
        }
    }

    /// Number of rooms holding media state on this node.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    #[must_use]
    pub fn router_id(&self, room: &RoomId) -> Option<RouterId> {
        self.rooms()
            .get(room)
            .and_then(|media| media.router.get().map(|h| h.id))
    }

    #[must_use]
    pub fn transport_count(&self, room: &RoomId) -> usize {
        self.rooms()
            .get(room)
            .map_or(0, |media| media.lock().transports.len())
    }

    #[must_use]
    pub fn producer_count(&self, room: &RoomId) -> usize {
        self.rooms()
            .get(room)
            .map_or(0, |media| media.lock().producers.len())
    }

    #[must_use]
    pub fn consumer_count(&self, room: &RoomId) -> usize {
        self.rooms()
            .get(room)
            .map_or(0, |media| media.lock().consumers.len())
    }

    /// Whether a consumer is currently paused. `None` if unknown.
    #[must_use]
    pub fn consumer_paused(&self, room: &RoomId, consumer: ConsumerId) -> Option<bool> {
        self.rooms()
            .get(room)
            .and_then(|media| media.lock().consumers.get(&consumer).map(|c| c.paused))
    }

    /// Whether a producer is currently paused. `None` if unknown.
    #[must_use]
    pub fn producer_paused(&self, room: &RoomId, producer: ProducerId) -> Option<bool> {
        self.rooms()
            .get(room)
            .and_then(|media| media.lock().producers.get(&producer).map(|p| p.paused))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackMediaEngine;
    use crate::media::types::{DtlsFingerprint, RtpCodecParameters};

    fn registry() -> (Arc<MediaRouterRegistry>, Arc<LoopbackMediaEngine>) {
        let engine = Arc::new(LoopbackMediaEngine::new("127.0.0.1"));
        let registry = Arc::new(MediaRouterRegistry::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            WorkerPool::new(2),
            Duration::from_secs(1),
        ));
        (registry, engine)
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some("client".to_string()),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD".to_string(),
            }],
        }
    }

    fn opus() -> RtpParameters {
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

    #[tokio::test]
    async fn test_concurrent_router_creation_yields_one_router() {
        let (registry, engine) = registry();
        let room = RoomId::from("class-1");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create_router(&room).await.unwrap()
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_routers_spread_over_workers() {
        let (registry, engine) = registry();
        let a = registry.get_or_create_router(&RoomId::from("a")).await.unwrap();
        let b = registry.get_or_create_router(&RoomId::from("b")).await.unwrap();

        assert_ne!(engine.router_worker(a), engine.router_worker(b));
    }

    #[tokio::test]
    async fn test_transport_connects_once() {
        let (registry, _) = registry();
        let room = RoomId::from("class-1");
        let conn = ConnectionId::new();
        registry.enter(&room, conn).await.unwrap();

        let info = registry
            .create_transport(&room, conn, TransportDirection::Send)
            .await
            .unwrap();
        registry
            .connect_transport(&room, conn, info.id, dtls())
            .await
            .unwrap();

        let again = registry.connect_transport(&room, conn, info.id, dtls()).await;
        assert!(matches!(again, Err(CsError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried() {
        let (registry, _) = registry();
        let room = RoomId::from("class-1");
        let conn = ConnectionId::new();
        registry.enter(&room, conn).await.unwrap();
        let info = registry
            .create_transport(&room, conn, TransportDirection::Recv)
            .await
            .unwrap();

        let empty = DtlsParameters {
            role: None,
            fingerprints: vec![],
        };
        assert!(registry
            .connect_transport(&room, conn, info.id, empty)
            .await
            .is_err());
        registry
            .connect_transport(&room, conn, info.id, dtls())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_foreign_transport_is_not_found() {
        let (registry, _) = registry();
        let room = RoomId::from("class-1");
        let owner = ConnectionId::new();
        let other = ConnectionId::new();
        registry.enter(&room, owner).await.unwrap();
        registry.enter(&room, other).await.unwrap();

        let info = registry
            .create_transport(&room, owner, TransportDirection::Send)
            .await
            .unwrap();
        let result = registry
            .produce(&room, other, info.id, MediaKind::Audio, opus())
            .await;
        assert!(matches!(result, Err(CsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_audio_producer_gets_elevated_priority() {
        let (registry, engine) = registry();
        let room = RoomId::from("class-1");
        let conn = ConnectionId::new();
        registry.enter(&room, conn).await.unwrap();
        let send = registry
            .create_transport(&room, conn, TransportDirection::Send)
            .await
            .unwrap();

        let producer = registry
            .produce(&room, conn, send.id, MediaKind::Audio, opus())
            .await
            .unwrap();

        assert_eq!(
            engine.producer_priority(producer),
            Some(ProducerPriority::ELEVATED)
        );
    }

    #[tokio::test]
    async fn test_incompatible_consume_creates_no_consumer() {
        let (registry, engine) = registry();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.enter(&room, a).await.unwrap();
        registry.enter(&room, b).await.unwrap();

        let send = registry
            .create_transport(&room, a, TransportDirection::Send)
            .await
            .unwrap();
        let producer = registry
            .produce(&room, a, send.id, MediaKind::Audio, opus())
            .await
            .unwrap();
        let recv = registry
            .create_transport(&room, b, TransportDirection::Recv)
            .await
            .unwrap();

        let result = registry
            .consume(&room, b, recv.id, producer, RtpCapabilities::default())
            .await;

        assert!(matches!(result, Err(CsError::IncompatibleCapabilities(_))));
        assert_eq!(registry.consumer_count(&room), 0);
        assert_eq!(engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_consumer_starts_paused_and_resumes() {
        let (registry, _) = registry();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.enter(&room, a).await.unwrap();
        registry.enter(&room, b).await.unwrap();

        let send = registry
            .create_transport(&room, a, TransportDirection::Send)
            .await
            .unwrap();
        let producer = registry
            .produce(&room, a, send.id, MediaKind::Audio, opus())
            .await
            .unwrap();
        let recv = registry
            .create_transport(&room, b, TransportDirection::Recv)
            .await
            .unwrap();
        let caps = registry.router_rtp_capabilities(&room).await.unwrap();

        let consumer = registry
            .consume(&room, b, recv.id, producer, caps)
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer);
        assert_eq!(registry.consumer_paused(&room, consumer.id), Some(true));

        registry.resume_consumer(&room, b, consumer.id).await.unwrap();
        assert_eq!(registry.consumer_paused(&room, consumer.id), Some(false));
    }

    #[tokio::test]
    async fn test_release_connection_cascades_and_is_idempotent() {
        let (registry, engine) = registry();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.enter(&room, a).await.unwrap();
        registry.enter(&room, b).await.unwrap();

        let send = registry
            .create_transport(&room, a, TransportDirection::Send)
            .await
            .unwrap();
        let _recv_a = registry
            .create_transport(&room, a, TransportDirection::Recv)
            .await
            .unwrap();
        let producer = registry
            .produce(&room, a, send.id, MediaKind::Audio, opus())
            .await
            .unwrap();
        let recv_b = registry
            .create_transport(&room, b, TransportDirection::Recv)
            .await
            .unwrap();
        let caps = registry.router_rtp_capabilities(&room).await.unwrap();
        registry
            .consume(&room, b, recv_b.id, producer, caps)
            .await
            .unwrap();

        let released = registry.release_connection(&room, a).await;
        assert_eq!(released.transports.len(), 2);
        assert_eq!(released.producers, vec![producer]);
        assert_eq!(released.consumers, 1);
        assert_eq!(registry.transport_count(&room), 1);
        assert_eq!(engine.consumer_count(), 0);

        let again = registry.release_connection(&room, a).await;
        assert_eq!(again, ReleasedMedia::default());
    }

    #[tokio::test]
    async fn test_idle_room_is_evicted_and_rejoin_clears_idle() {
        let (registry, engine) = registry();
        let room = RoomId::from("class-1");
        let conn = ConnectionId::new();
        registry.enter(&room, conn).await.unwrap();

        assert_eq!(registry.evict_idle(Duration::ZERO).await, 0);

        registry.release_connection(&room, conn).await;
        registry.enter(&room, conn).await.unwrap();
        assert_eq!(registry.evict_idle(Duration::ZERO).await, 0);

        registry.release_connection(&room, conn).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.evict_idle(Duration::ZERO).await, 1);
        assert_eq!(registry.room_count(), 0);
        assert_eq!(engine.router_count(), 0);
    }

    #[tokio::test]
    async fn test_calls_against_unknown_room_are_not_found() {
        let (registry, _) = registry();
        let room = RoomId::from("nowhere");

        assert!(matches!(
            registry.router_rtp_capabilities(&room).await,
            Err(CsError::NotFound(_))
        ));
        assert!(matches!(
            registry
                .create_transport(&room, ConnectionId::new(), TransportDirection::Send)
                .await,
            Err(CsError::NotFound(_))
        ));
    }
}
