//! Event Bus: room-scoped and per-connection fan-out.
//!
//! Delivery is best-effort at-least-once to currently subscribed connections;
//! there is no durable queue. Events published by one caller to one room are
//! delivered in publish order. Nothing is promised across publishers.
//!
//! Two implementations share the [`EventBus`] trait:
//!
//! - [`LocalEventBus`]: process-local registry of connection outboxes and room
//!   subscriptions.
//! - [`RedisEventBus`]: wraps a local bus and mirrors every publish onto Redis
//!   pub/sub so connections hosted on other nodes receive it too.

mod local;
mod redis_bus;

pub use local::{LocalEventBus, CONNECTION_OUTBOX_CAPACITY};
pub use redis_bus::{Envelope, EnvelopeTarget, RedisEventBus};

use crate::protocol::ServerEvent;
use common::types::{ConnectionId, RoomId};
use tokio::sync::mpsc;

/// Fan-out of server events to signaling connections.
pub trait EventBus: Send + Sync {
    /// Register a connection hosted on this node and return its outbox.
    fn register(&self, connection: ConnectionId) -> mpsc::Receiver<ServerEvent>;

    /// Drop a connection and all of its room subscriptions.
    fn unregister(&self, connection: ConnectionId);

    /// Subscribe a connection to a room's broadcasts.
    fn join_room(&self, connection: ConnectionId, room: &RoomId);

    fn leave_room(&self, connection: ConnectionId, room: &RoomId);

    /// Deliver `event` to every connection subscribed to `room`, on any node,
    /// except `exclude`.
    fn broadcast_to_room(&self, room: &RoomId, event: ServerEvent, exclude: Option<ConnectionId>);

    /// Deliver `event` to one connection, wherever it is hosted.
    fn send_to_connection(&self, connection: ConnectionId, event: ServerEvent);
}
