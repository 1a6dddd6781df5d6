//! # CS Test Utilities
//!
//! Shared test utilities for the Classroom Service (CS).
//!
//! ## Modules
//!
//! - `mock_backend` - In-memory users, classes, attendance and chat backend
//! - `flaky_store` - Presence store wrapper with failure injection
//! - `fixtures` - RTP/DTLS payloads and signaling frame builders
//! - `harness` - In-process gateway and real signaling server for E2E tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cs_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let classroom = TestClassroom::new();
//!     let mut alice = classroom.connect();
//!
//!     classroom.send(&alice, &join_frame("class-1", "alice", "Alice")).await;
//!     let reply = alice.next_event().await;
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod flaky_store;
pub mod harness;
pub mod mock_backend;

pub use fixtures::*;
pub use flaky_store::FlakyPresenceStore;
pub use harness::{TestClassroom, TestClassroomServer, TestConnection, TestWsClient};
pub use mock_backend::{MockBackend, MockBackendBuilder};
