//! Per-connection task.
//!
//! # Lifecycle
//!
//! 1. Registered with the gateway, which hands back the connection's outbox
//! 2. Loops over inbound frames, outbox events and cancellation
//! 3. On close, the gateway releases the binding, media and subscriptions
//!
//! The socket loop never waits on a handler. Text frames are queued to a
//! frame worker that handles them in arrival order, each in its own task, so a
//! panicking handler only fails that message. Meanwhile the loop keeps
//! writing outbox events and notices close and shutdown right away. While the
//! queue is full the loop stops reading the socket, leaving backpressure to
//! TCP.

use super::SignalingState;
use crate::errors::CsError;
use crate::gateway::SessionGateway;
use crate::observability::metrics::record_handler_panic;
use crate::protocol::ServerEvent;
use axum::extract::ws::{Message, WebSocket};
use common::types::ConnectionId;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type WsSink = SplitSink<WebSocket, Message>;

/// Frames accepted from one client but not yet handled.
const INBOUND_FRAME_QUEUE: usize = 64;

#[instrument(skip_all, name = "cs.ws.connection", fields(connection_id = tracing::field::Empty))]
pub(super) async fn run_connection(socket: WebSocket, state: Arc<SignalingState>) {
    let connection = ConnectionId::new();
    tracing::Span::current().record("connection_id", tracing::field::display(connection));

    let gateway = Arc::clone(&state.gateway);
    let cancel = state.shutdown.child_token();
    let mut outbox = gateway.connect(connection);
    state.connection_opened();
    info!(target: "cs.ws", connection_id = %connection, "Connection opened");

    let (frames_tx, frames_rx) = mpsc::channel(INBOUND_FRAME_QUEUE);
    let worker_cancel = cancel.child_token();
    let worker = tokio::spawn(handle_frames(
        Arc::clone(&gateway),
        connection,
        frames_rx,
        worker_cancel.clone(),
    ));

    let (mut sink, mut stream) = socket.split();
    let mut pending: Option<String> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target: "cs.ws", connection_id = %connection, "Shutdown, closing connection");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            event = outbox.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !send_event(&mut sink, connection, &event).await {
                    break;
                }
            }

            Ok(permit) = frames_tx.reserve(), if pending.is_some() => {
                if let Some(text) = pending.take() {
                    permit.send(text);
                }
            }

            frame = stream.next(), if pending.is_none() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match frames_tx.try_send(text) {
                        Ok(()) => {}
                        Err(TrySendError::Full(text)) => {
                            debug!(target: "cs.ws", connection_id = %connection, "Inbound frame queue full, pausing reads");
                            pending = Some(text);
                        }
                        Err(TrySendError::Closed(_)) => break,
                    },
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ServerEvent::error(
                            None,
                            &CsError::Validation("binary frames are not supported".to_string()),
                        );
                        if !send_event(&mut sink, connection, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(target: "cs.ws", connection_id = %connection, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        }
    }

    // Queued frames are dropped. A frame already being handled finishes
    // first, so the binding it creates is visible to the cleanup below.
    drop(frames_tx);
    worker_cancel.cancel();
    let frames_handled = match worker.await {
        Ok(handled) => handled,
        Err(e) => {
            error!(target: "cs.ws", connection_id = %connection, error = %e, "Frame worker failed");
            0
        }
    };

    gateway.disconnect(connection).await;
    state.connection_closed();
    info!(target: "cs.ws", connection_id = %connection, frames_handled, "Connection closed");
}

/// Handle a connection's frames in arrival order until the queue closes or
/// the connection is cancelled. Returns the number of frames handled.
async fn handle_frames(
    gateway: Arc<SessionGateway>,
    connection: ConnectionId,
    mut frames: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> u64 {
    let mut handled: u64 = 0;

    loop {
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            text = frames.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        handled += 1;

        let handler_gateway = Arc::clone(&gateway);
        let task = tokio::spawn(async move {
            handler_gateway.handle_frame(connection, &text).await;
        });
        if let Err(e) = task.await {
            error!(target: "cs.ws", connection_id = %connection, error = %e, "Signaling handler panicked");
            record_handler_panic();
            gateway.send_to(
                connection,
                ServerEvent::error(None, &CsError::Internal("handler panicked".to_string())),
            );
        }
    }

    handled
}

/// Write one event. Returns `false` once the socket is unusable.
async fn send_event(sink: &mut WsSink, connection: ConnectionId, event: &ServerEvent) -> bool {
    let text = match event.to_frame() {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "cs.ws", connection_id = %connection, error = %e, "Dropping unencodable event");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}
