//! Process-local event bus.

use super::EventBus;
use crate::observability::metrics::record_bus_event_dropped;
use crate::protocol::ServerEvent;
use common::types::{ConnectionId, RoomId};
use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbox capacity per connection. A connection that falls this far behind
/// loses events rather than stalling the publisher.
pub const CONNECTION_OUTBOX_CAPACITY: usize = 256;

/// In-memory [`EventBus`] for connections hosted on this node.
#[derive(Default)]
pub struct LocalEventBus {
    outboxes: DashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl LocalEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `connection` is registered on this node.
    #[must_use]
    pub fn is_local(&self, connection: ConnectionId) -> bool {
        self.outboxes.contains_key(&connection)
    }

    /// Connections on this node subscribed to `room`.
    #[must_use]
    pub fn room_connections(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections registered on this node.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Push into one outbox. Returns `false` if the connection is not hosted
    /// here.
    pub(crate) fn deliver(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        let Some(outbox) = self.outboxes.get(&connection).map(|o| o.value().clone()) else {
            return false;
        };
        match outbox.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "cs.bus", connection_id = %connection, "Connection outbox full, dropping event");
                record_bus_event_dropped("outbox_full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: "cs.bus", connection_id = %connection, "Connection outbox closed");
                true
            }
        }
    }

    /// Deliver to local room subscribers. Returns the number of recipients.
    pub(crate) fn deliver_to_room(
        &self,
        room: &RoomId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let recipients: Vec<ConnectionId> = self
            .room_connections(room)
            .into_iter()
            .filter(|c| Some(*c) != exclude)
            .collect();
        for connection in &recipients {
            self.deliver(*connection, event.clone());
        }
        recipients.len()
    }
}

impl EventBus for LocalEventBus {
    fn register(&self, connection: ConnectionId) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(CONNECTION_OUTBOX_CAPACITY);
        self.outboxes.insert(connection, tx);
        rx
    }

    fn unregister(&self, connection: ConnectionId) {
        self.outboxes.remove(&connection);
        self.rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    fn join_room(&self, connection: ConnectionId, room: &RoomId) {
        self.rooms.entry(room.clone()).or_default().insert(connection);
    }

    fn leave_room(&self, connection: ConnectionId, room: &RoomId) {
        let now_empty = self
            .rooms
            .get_mut(room)
            .map(|mut members| {
                members.remove(&connection);
                members.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
    }

    fn broadcast_to_room(&self, room: &RoomId, event: ServerEvent, exclude: Option<ConnectionId>) {
        let delivered = self.deliver_to_room(room, &event, exclude);
        debug!(target: "cs.bus", room = %room, delivered, "Room broadcast");
    }

    fn send_to_connection(&self, connection: ConnectionId, event: ServerEvent) {
        if !self.deliver(connection, event) {
            debug!(target: "cs.bus", connection_id = %connection, "Target connection not registered");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::RoomRef;

    fn event(room: &str) -> ServerEvent {
        ServerEvent::JoinedRoom(RoomRef {
            class_id: RoomId::from(room),
        })
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let bus = LocalEventBus::new();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let mut rx_a = bus.register(a);
        let mut rx_b = bus.register(b);
        bus.join_room(a, &room);
        bus.join_room(b, &room);

        bus.broadcast_to_room(&room, event("class-1"), Some(a));

        assert_eq!(rx_b.recv().await.unwrap(), event("class-1"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_keep_publish_order() {
        let bus = LocalEventBus::new();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let mut rx = bus.register(a);
        bus.join_room(a, &room);

        for i in 0..10 {
            bus.broadcast_to_room(&room, event(&i.to_string()), None);
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), event(&i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_other_rooms_do_not_receive() {
        let bus = LocalEventBus::new();
        let a = ConnectionId::new();
        let mut rx = bus.register(a);
        bus.join_room(a, &RoomId::from("class-2"));

        bus.broadcast_to_room(&RoomId::from("class-1"), event("x"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_drops_subscriptions() {
        let bus = LocalEventBus::new();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let _rx = bus.register(a);
        bus.join_room(a, &room);

        bus.unregister(a);

        assert!(bus.room_connections(&room).is_empty());
        assert!(!bus.is_local(a));
    }

    #[test]
    fn test_leave_room_removes_empty_room() {
        let bus = LocalEventBus::new();
        let room = RoomId::from("class-1");
        let a = ConnectionId::new();
        let _rx = bus.register(a);
        bus.join_room(a, &room);
        bus.leave_room(a, &room);
        bus.leave_room(a, &room);

        assert!(bus.room_connections(&room).is_empty());
        assert!(bus.is_local(a));
    }

    #[tokio::test]
    async fn test_full_outbox_drops_without_blocking() {
        let bus = LocalEventBus::new();
        let a = ConnectionId::new();
        let mut rx = bus.register(a);

        for _ in 0..CONNECTION_OUTBOX_CAPACITY + 5 {
            bus.send_to_connection(a, event("x"));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CONNECTION_OUTBOX_CAPACITY);
    }
}
