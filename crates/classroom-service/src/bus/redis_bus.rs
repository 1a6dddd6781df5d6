//! Cross-node fan-out over Redis pub/sub.
//!
//! # Channels
//!
//! - `classroom:events:room:{id}` - Room broadcasts
//! - `classroom:events:direct` - Events addressed to one connection
//!
//! Every publish is delivered to local subscribers first, then wrapped in an
//! [`Envelope`] carrying the origin node id and queued for Redis. Subscribers
//! ignore envelopes from their own node, since those were already delivered.
//!
//! Publishing never blocks a handler: envelopes go through a bounded queue
//! drained by one task, and are dropped (and counted) when the queue is full.
//! A single publisher task also keeps per-room publish order intact.

use super::local::LocalEventBus;
use super::EventBus;
use crate::errors::CsError;
use crate::observability::metrics::record_bus_event_dropped;
use crate::protocol::ServerEvent;
use common::types::{ConnectionId, RoomId};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timeout for connecting and subscribing.
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Envelopes waiting for the publisher task.
pub const PUBLISH_QUEUE_CAPACITY: usize = 10_000;

const ROOM_CHANNEL_PREFIX: &str = "classroom:events:room:";
const ROOM_CHANNEL_PATTERN: &str = "classroom:events:room:*";
const DIRECT_CHANNEL: &str = "classroom:events:direct";

fn room_channel(room: &RoomId) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room}")
}

/// Addressing of a mirrored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeTarget {
    Room {
        room: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude: Option<ConnectionId>,
    },
    Connection {
        connection: ConnectionId,
    },
}

/// Wire format on Redis channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub node_id: String,
    pub target: EnvelopeTarget,
    pub event: ServerEvent,
}

impl Envelope {
    fn channel(&self) -> String {
        match &self.target {
            EnvelopeTarget::Room { room, .. } => room_channel(room),
            EnvelopeTarget::Connection { .. } => DIRECT_CHANNEL.to_string(),
        }
    }
}

enum SubscriberExit {
    /// Connected and subscribed, then the stream ended.
    Disconnected,
    ConnectFailed(String),
}

/// Redis-backed [`EventBus`].
pub struct RedisEventBus {
    local: Arc<LocalEventBus>,
    node_id: String,
    publish_tx: mpsc::Sender<Envelope>,
}

impl RedisEventBus {
    /// Start the publisher and subscriber tasks.
    ///
    /// Both tasks reconnect with exponential backoff (1s to 30s) and stop when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// `CsError::StoreUnavailable` if the Redis URL cannot be parsed.
    pub fn start(
        redis_url: &str,
        node_id: String,
        local: Arc<LocalEventBus>,
        cancel: CancellationToken,
    ) -> Result<Self, CsError> {
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "cs.bus", error = %e, "Failed to open Redis client for fan-out");
            CsError::StoreUnavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);

        tokio::spawn(run_publisher(client.clone(), publish_rx, cancel.clone()));
        tokio::spawn(run_subscriber_loop(
            client,
            node_id.clone(),
            Arc::clone(&local),
            cancel,
        ));

        info!(target: "cs.bus", node_id = %node_id, "Redis fan-out started");
        Ok(Self {
            local,
            node_id,
            publish_tx,
        })
    }

    fn mirror(&self, target: EnvelopeTarget, event: ServerEvent) {
        let envelope = Envelope {
            node_id: self.node_id.clone(),
            target,
            event,
        };
        match self.publish_tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "cs.bus", "Publish queue full, dropping cross-node event");
                record_bus_event_dropped("queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_bus_event_dropped("publisher_stopped");
            }
        }
    }
}

impl EventBus for RedisEventBus {
    fn register(&self, connection: ConnectionId) -> mpsc::Receiver<ServerEvent> {
        self.local.register(connection)
    }

    fn unregister(&self, connection: ConnectionId) {
        self.local.unregister(connection);
    }

    fn join_room(&self, connection: ConnectionId, room: &RoomId) {
        self.local.join_room(connection, room);
    }

    fn leave_room(&self, connection: ConnectionId, room: &RoomId) {
        self.local.leave_room(connection, room);
    }

    fn broadcast_to_room(&self, room: &RoomId, event: ServerEvent, exclude: Option<ConnectionId>) {
        self.local.deliver_to_room(room, &event, exclude);
        self.mirror(
            EnvelopeTarget::Room {
                room: room.clone(),
                exclude,
            },
            event,
        );
    }

    fn send_to_connection(&self, connection: ConnectionId, event: ServerEvent) {
        if self.local.deliver(connection, event.clone()) {
            return;
        }
        self.mirror(EnvelopeTarget::Connection { connection }, event);
    }
}

/// Apply an envelope received from Redis to the local bus.
///
/// Returns `false` when the envelope was ignored (own node or undecodable).
pub(crate) fn dispatch_envelope(local: &LocalEventBus, node_id: &str, payload: &str) -> bool {
    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(target: "cs.bus", error = %e, "Failed to decode fan-out envelope");
            return false;
        }
    };

    if envelope.node_id == node_id {
        return false;
    }

    match envelope.target {
        EnvelopeTarget::Room { room, exclude } => {
            let delivered = local.deliver_to_room(&room, &envelope.event, exclude);
            debug!(target: "cs.bus", room = %room, delivered, origin = %envelope.node_id, "Forwarded remote room event");
        }
        EnvelopeTarget::Connection { connection } => {
            local.deliver(connection, envelope.event);
        }
    }
    true
}

async fn connect(client: &Client) -> Result<MultiplexedConnection, String> {
    match timeout(REDIS_TIMEOUT, client.get_multiplexed_async_connection()).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timed out".to_string()),
    }
}

async fn run_publisher(
    client: Client,
    mut publish_rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        let mut conn = tokio::select! {
            () = cancel.cancelled() => return,
            result = connect(&client) => match result {
                Ok(conn) => {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    conn
                }
                Err(e) => {
                    error!(target: "cs.bus", error = %e, backoff_secs, "Publisher failed to connect to Redis");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            },
        };
        info!(target: "cs.bus", "Redis publisher connected");

        loop {
            let envelope = tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "cs.bus", "Redis publisher stopping");
                    return;
                }
                envelope = publish_rx.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                return;
            };

            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(target: "cs.bus", error = %e, "Failed to encode fan-out envelope");
                    record_bus_event_dropped("serialize");
                    continue;
                }
            };

            let channel = envelope.channel();
            match timeout(REDIS_TIMEOUT, conn.publish::<_, _, i64>(&channel, payload)).await {
                Ok(Ok(receivers)) => {
                    debug!(target: "cs.bus", channel = %channel, receivers, "Published fan-out envelope");
                }
                Ok(Err(e)) => {
                    warn!(target: "cs.bus", error = %e, "Publish failed, reconnecting");
                    record_bus_event_dropped("publish_failed");
                    break;
                }
                Err(_) => {
                    warn!(target: "cs.bus", "Publish timed out, reconnecting");
                    record_bus_event_dropped("publish_failed");
                    break;
                }
            }
        }
    }
}

async fn run_subscriber_loop(
    client: Client,
    node_id: String,
    local: Arc<LocalEventBus>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        let exit = tokio::select! {
            () = cancel.cancelled() => {
                info!(target: "cs.bus", "Redis subscriber stopping");
                return;
            }
            exit = run_subscriber(&client, &node_id, &local) => exit,
        };

        match exit {
            SubscriberExit::Disconnected => {
                error!(target: "cs.bus", "Redis subscriber stream ended, reconnecting");
                backoff_secs = INITIAL_BACKOFF_SECS;
            }
            SubscriberExit::ConnectFailed(e) => {
                error!(target: "cs.bus", error = %e, backoff_secs, "Redis subscriber failed to connect");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn run_subscriber(client: &Client, node_id: &str, local: &LocalEventBus) -> SubscriberExit {
    let mut pubsub = match timeout(REDIS_TIMEOUT, client.get_async_pubsub()).await {
        Ok(Ok(pubsub)) => pubsub,
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => return SubscriberExit::ConnectFailed("timed out".to_string()),
    };

    match timeout(REDIS_TIMEOUT, pubsub.psubscribe(ROOM_CHANNEL_PATTERN)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => return SubscriberExit::ConnectFailed("psubscribe timed out".to_string()),
    }
    match timeout(REDIS_TIMEOUT, pubsub.subscribe(DIRECT_CHANNEL)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.to_string()),
        Err(_) => return SubscriberExit::ConnectFailed("subscribe timed out".to_string()),
    }

    info!(target: "cs.bus", "Redis subscriber connected");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "cs.bus", error = %e, channel = %msg.get_channel_name(), "Invalid fan-out payload");
                continue;
            }
        };
        dispatch_envelope(local, node_id, &payload);
    }

    SubscriberExit::Disconnected
}
