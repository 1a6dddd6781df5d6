//! Background eviction of idle rooms.

use super::MediaRouterRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn the idle-room sweeper.
///
/// Every `interval`, rooms with no occupants and no live transports that have
/// been idle for at least `idle_timeout` are torn down. Exits when `cancel`
/// fires.
pub fn spawn_room_sweeper(
    registry: Arc<MediaRouterRegistry>,
    interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            target: "cs.media",
            interval_secs = interval.as_secs(),
            idle_timeout_secs = idle_timeout.as_secs(),
            "Room sweeper started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "cs.media", "Room sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = registry.evict_idle(idle_timeout).await;
                    if evicted > 0 {
                        debug!(target: "cs.media", evicted, "Sweep evicted idle rooms");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{LoopbackMediaEngine, MediaEngine, WorkerPool};
    use common::types::{ConnectionId, RoomId};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_after_idle_timeout() {
        let engine = Arc::new(LoopbackMediaEngine::new("127.0.0.1"));
        let registry = Arc::new(MediaRouterRegistry::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            WorkerPool::new(1),
            Duration::from_secs(1),
        ));
        let room = RoomId::from("class-1");
        let conn = ConnectionId::new();
        registry.enter(&room, conn).await.unwrap();
        registry.release_connection(&room, conn).await;

        let cancel = CancellationToken::new();
        let handle = spawn_room_sweeper(
            Arc::clone(&registry),
            Duration::from_millis(10),
            Duration::ZERO,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.room_count(), 0);
        assert_eq!(engine.router_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
