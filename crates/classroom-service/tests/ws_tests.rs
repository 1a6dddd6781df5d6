//! End-to-end signaling tests over a real WebSocket listener.
//!
//! Verifies the wire format (`{"event", "data"}` frames, kebab-case names,
//! camelCase fields), error replies for bad frames, disconnect cleanup and
//! shutdown propagation.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::time::{Duration, Instant};

use classroom_service::presence::PresenceStore;
use common::types::RoomId;
use cs_test_utils::*;
use serde_json::json;

const ROOM: &str = "class-101";

/// Poll until `check` holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_join_over_websocket() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();

    let joined = alice.expect_event("joined-room").await;
    assert_eq!(joined, json!({ "classId": ROOM }));
    let attendance = alice.expect_event("current-attendance").await;
    assert_eq!(attendance, json!(["alice"]));

    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();
    bob.send_text(&join_frame(ROOM, "bob", "Bob")).await.unwrap();

    let user_joined = alice.expect_event("user-joined").await;
    assert_eq!(user_joined["userId"], "bob");
    assert_eq!(user_joined["fullName"], "Bob");
    assert!(user_joined["connectionId"].is_string());

    bob.expect_event("joined-room").await;
    assert_eq!(
        bob.expect_event("current-attendance").await,
        json!(["alice", "bob"])
    );
}

#[tokio::test]
async fn test_bad_frames_get_error_replies() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut client = TestWsClient::connect(&server.ws_url()).await.unwrap();

    client.send_text("not json").await.unwrap();
    let error = client.expect_event("error").await;
    assert_eq!(error["code"], 1);
    assert_eq!(error["retriable"], false);

    client
        .send_text(&json!({"event": "produce", "data": {"classId": ROOM}}).to_string())
        .await
        .unwrap();
    let error = client.expect_event("error").await;
    assert_eq!(error["event"], "produce");

    client.send_binary(vec![1, 2, 3]).await.unwrap();
    assert_eq!(client.expect_event("error").await["code"], 1);

    // The connection survives bad frames
    client
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    client.expect_event("joined-room").await;
}

#[tokio::test]
async fn test_chat_round_trip_over_websocket() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    alice.expect_event("joined-room").await;
    alice.expect_event("current-attendance").await;
    bob.send_text(&join_frame(ROOM, "bob", "Bob")).await.unwrap();
    bob.expect_event("joined-room").await;
    bob.expect_event("current-attendance").await;
    alice.expect_event("user-joined").await;

    bob.send_text(&chat_frame(ROOM, "bob", "Is the quiz today?"))
        .await
        .unwrap();

    let to_alice = alice.expect_event("chat-message").await;
    let to_bob = bob.expect_event("chat-message").await;
    let persisted = server.classroom().backend.chat_messages();
    assert_eq!(persisted.len(), 1);

    for chat in [to_alice, to_bob] {
        assert_eq!(chat["id"], persisted[0].message_id.as_str());
        assert_eq!(chat["message"], "Is the quiz today?");
        assert!(chat["senderId"].is_string());
        assert!(chat["createdAt"].is_string());
        assert_eq!(chat["user"]["user_id"], "bob");
        assert_eq!(chat["user"]["full_name"], "bob");
    }
}

#[tokio::test]
async fn test_closing_socket_cleans_up_presence() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    alice.expect_event("joined-room").await;
    alice.expect_event("current-attendance").await;
    bob.send_text(&join_frame(ROOM, "bob", "Bob")).await.unwrap();
    bob.expect_event("joined-room").await;
    bob.expect_event("current-attendance").await;
    alice.expect_event("user-joined").await;
    assert_eq!(server.active_connections(), 2);

    bob.close().await;

    let left = alice.expect_event("user-left").await;
    assert_eq!(left["userId"], "bob");

    eventually(|| server.active_connections() == 1).await;
    let members = server
        .classroom()
        .presence
        .list_members(&RoomId::from(ROOM))
        .await
        .unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].as_str(), "alice");
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    alice.expect_event("joined-room").await;
    alice.expect_event("current-attendance").await;

    server.shutdown();

    assert!(alice.next_frame().await.is_none());
    eventually(|| server.active_connections() == 0).await;
    assert_eq!(
        server.classroom().backend.attendance_for("alice", ROOM).len(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_handler_does_not_stall_outbound_events() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    alice.expect_event("joined-room").await;
    alice.expect_event("current-attendance").await;
    bob.send_text(&join_frame(ROOM, "bob", "Bob")).await.unwrap();
    bob.expect_event("joined-room").await;
    bob.expect_event("current-attendance").await;
    alice.expect_event("user-joined").await;

    server
        .classroom()
        .backend
        .set_chat_delay(Duration::from_millis(400));

    // Alice's chat is still being persisted while more strokes arrive for
    // her than her outbox holds
    alice
        .send_text(&chat_frame(ROOM, "alice", "one moment"))
        .await
        .unwrap();
    for stroke in 0..300 {
        bob.send_text(&relay_frame("draw-event", ROOM, None, json!({ "stroke": stroke })))
            .await
            .unwrap();
    }

    let mut strokes = 0;
    let mut chat = None;
    while strokes < 300 || chat.is_none() {
        let frame = alice.next_frame().await.expect("connection closed");
        match frame["event"].as_str() {
            Some("draw-event") => strokes += 1,
            Some("chat-message") => chat = Some(frame["data"].clone()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(chat.unwrap()["message"], "one moment");
}

#[tokio::test]
async fn test_shutdown_is_not_held_up_by_a_slow_handler() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    alice.expect_event("joined-room").await;
    alice.expect_event("current-attendance").await;

    server
        .classroom()
        .backend
        .set_chat_delay(Duration::from_millis(800));
    alice
        .send_text(&chat_frame(ROOM, "alice", "still typing"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    server.shutdown();
    assert!(alice.next_frame().await.is_none());
    assert!(
        start.elapsed() < Duration::from_millis(400),
        "close took {:?}",
        start.elapsed()
    );

    eventually(|| server.active_connections() == 0).await;
}

#[tokio::test]
async fn test_media_negotiation_over_websocket() {
    let server = TestClassroomServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice
        .send_text(&join_frame(ROOM, "alice", "Alice"))
        .await
        .unwrap();
    alice.expect_event("joined-room").await;
    alice.expect_event("current-attendance").await;

    alice.send_text(&capabilities_frame(ROOM)).await.unwrap();
    let capabilities = alice.expect_event("router-rtp-capabilities").await;
    assert_eq!(capabilities["codecs"][0]["mimeType"], "audio/opus");

    alice
        .send_text(&create_transport_frame(ROOM, true))
        .await
        .unwrap();
    let transport = alice.expect_event("transport-created").await;
    assert!(transport["iceParameters"]["usernameFragment"].is_string());
    assert_eq!(transport["iceCandidates"][0]["ip"], "127.0.0.1");
    assert!(!transport["dtlsParameters"]["fingerprints"]
        .as_array()
        .unwrap()
        .is_empty());
    let transport_id = transport["id"].as_str().unwrap().to_string();

    alice
        .send_text(&connect_transport_frame(ROOM, &transport_id))
        .await
        .unwrap();
    let connected = alice.expect_event("transport-connected").await;
    assert_eq!(connected["transportId"], transport_id.as_str());

    alice
        .send_text(&produce_audio_frame(ROOM, &transport_id))
        .await
        .unwrap();
    let produced = alice.expect_event("produced").await;
    assert!(produced["id"].is_string());
}
