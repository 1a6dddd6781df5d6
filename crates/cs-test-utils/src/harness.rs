//! Test harnesses.
//!
//! - [`TestClassroom`] wires a real [`SessionGateway`] to in-memory
//!   collaborators, presence and event bus. Frames go straight into
//!   `handle_frame`; every event a connection receives lands in its
//!   [`TestConnection`] outbox before `send` returns. [`TestClassroom::peer`]
//!   adds a second node over the same presence store.
//! - [`TestClassroomServer`] serves the same gateway over a real WebSocket
//!   listener on a random port, for end-to-end tests with [`TestWsClient`].

use crate::flaky_store::FlakyPresenceStore;
use crate::mock_backend::MockBackend;
use classroom_service::bus::{EventBus, LocalEventBus};
use classroom_service::collaborators::Collaborators;
use classroom_service::gateway::SessionGateway;
use classroom_service::media::{LoopbackMediaEngine, MediaRouterRegistry, WorkerPool};
use classroom_service::presence::PresenceStore;
use classroom_service::protocol::{ErrorPayload, ServerEvent};
use classroom_service::ws::{signaling_router, SignalingState};
use common::types::ConnectionId;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// How long tests wait for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for collaborator and media calls inside the harness.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// A gateway with in-memory dependencies.
pub struct TestClassroom {
    pub gateway: Arc<SessionGateway>,
    pub backend: Arc<MockBackend>,
    pub presence: Arc<FlakyPresenceStore>,
    pub media: Arc<MediaRouterRegistry>,
    pub bus: Arc<LocalEventBus>,
}

impl Default for TestClassroom {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClassroom {
    /// A classroom whose backend knows every user and class.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(MockBackend::permissive())
    }

    #[must_use]
    pub fn with_backend(backend: MockBackend) -> Self {
        Self::assemble(Arc::new(backend), Arc::new(FlakyPresenceStore::new()))
    }

    /// A second node: its own gateway, event bus and media registry, sharing
    /// this node's presence store and backend the way nodes share Redis.
    #[must_use]
    pub fn peer(&self) -> Self {
        Self::assemble(Arc::clone(&self.backend), Arc::clone(&self.presence))
    }

    fn assemble(backend: Arc<MockBackend>, presence: Arc<FlakyPresenceStore>) -> Self {
        let bus = Arc::new(LocalEventBus::new());
        let media = Arc::new(MediaRouterRegistry::new(
            Arc::new(LoopbackMediaEngine::new("127.0.0.1")),
            WorkerPool::new(2),
            CALL_TIMEOUT,
        ));
        let gateway = Arc::new(SessionGateway::new(
            Arc::clone(&presence) as Arc<dyn PresenceStore>,
            Arc::clone(&media),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Collaborators::from_backend(Arc::clone(&backend)),
            CALL_TIMEOUT,
        ));
        Self {
            gateway,
            backend,
            presence,
            media,
            bus,
        }
    }

    /// Register a new connection with the gateway.
    pub fn connect(&self) -> TestConnection {
        let id = ConnectionId::new();
        let outbox = self.gateway.connect(id);
        TestConnection { id, outbox }
    }

    /// Deliver one text frame as `connection`.
    pub async fn send(&self, connection: &TestConnection, frame: &str) {
        self.gateway.handle_frame(connection.id, frame).await;
    }

    /// Close `connection` the way a dropped socket would.
    pub async fn disconnect(&self, connection: &TestConnection) {
        self.gateway.disconnect(connection.id).await;
    }

    /// Connect and join `class_id` as `user_id`, discarding the join replies.
    pub async fn join(&self, class_id: &str, user_id: &str) -> TestConnection {
        let mut connection = self.connect();
        self.send(&connection, &crate::fixtures::join_frame(class_id, user_id, user_id))
            .await;
        match connection.next_event().await {
            ServerEvent::JoinedRoom(_) => {}
            other => panic!("join of {user_id} failed: {other:?}"),
        }
        connection.drain();
        connection
    }
}

/// One connection's view of the gateway.
pub struct TestConnection {
    pub id: ConnectionId,
    outbox: mpsc::Receiver<ServerEvent>,
}

impl TestConnection {
    /// Next event, failing the test if none arrives in time.
    pub async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.outbox.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("outbox closed")
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<ServerEvent> {
        self.outbox.try_recv().ok()
    }

    /// Every queued event.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbox.try_recv() {
            events.push(event);
        }
        events
    }

    /// Next event, which must be an error reply.
    pub async fn expect_error(&mut self) -> ErrorPayload {
        match self.next_event().await {
            ServerEvent::Error(payload) => payload,
            other => panic!("expected an error reply, got {other:?}"),
        }
    }

    /// Assert nothing is queued.
    pub fn assert_quiet(&mut self) {
        if let Some(event) = self.try_next() {
            panic!("unexpected event: {event:?}");
        }
    }
}

/// A signaling server listening on a random local port.
///
/// # Example
/// ```rust,ignore
/// let server = TestClassroomServer::spawn().await?;
/// let mut client = TestWsClient::connect(&server.ws_url()).await?;
/// client.send_text(&join_frame("class-1", "alice", "Alice")).await?;
/// ```
pub struct TestClassroomServer {
    addr: SocketAddr,
    classroom: TestClassroom,
    state: Arc<SignalingState>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestClassroomServer {
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(TestClassroom::new()).await
    }

    pub async fn spawn_with(classroom: TestClassroom) -> Result<Self, anyhow::Error> {
        let shutdown = CancellationToken::new();
        let state = Arc::new(SignalingState::new(
            Arc::clone(&classroom.gateway),
            shutdown.child_token(),
        ));
        let app = signaling_router(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let server_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            classroom,
            state,
            shutdown,
            handle,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn classroom(&self) -> &TestClassroom {
        &self.classroom
    }

    /// Open signaling connections as counted by the server.
    pub fn active_connections(&self) -> u64 {
        self.state.active_connections()
    }

    /// Cancel the server token, closing every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestClassroomServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// Minimal WebSocket client speaking the signaling frame format.
pub struct TestWsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestWsClient {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self { stream })
    }

    pub async fn send_text(&mut self, frame: &str) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Next text frame as JSON. Returns `None` when the server closed the
    /// connection.
    pub async fn next_frame(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(EVENT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for a frame")?;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next frame, which must be named `event`. Returns its `data`.
    pub async fn expect_event(&mut self, event: &str) -> Value {
        let frame = self.next_frame().await.expect("connection closed");
        assert_eq!(frame["event"], event, "unexpected frame: {frame}");
        frame["data"].clone()
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
