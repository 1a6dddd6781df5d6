//! Classroom Service Library
//!
//! Live session coordinator for virtual classrooms:
//!
//! - WebSocket signaling for join/leave, chat and WebRTC negotiation
//! - Room presence shared across nodes through Redis
//! - SFU orchestration: one media router per room, with transports,
//!   producers and consumers owned by the room's registry entry
//! - Attendance and chat persistence through the backend API
//!
//! # Architecture
//!
//! ```text
//! ws (one task per socket)
//! └── gateway::SessionGateway (dispatch per inbound event)
//!     ├── presence::PresenceStore     room membership + connection bindings
//!     ├── media::MediaRouterRegistry  routers, transports, producers, consumers
//!     ├── bus::EventBus               room broadcasts + unicasts, cross-node
//!     └── collaborators               users, classes, attendance, chat
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes
//! - [`protocol`] - Signaling frame schema
//! - [`observability`] - Tracing, metrics and health endpoints

pub mod bus;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod media;
pub mod observability;
pub mod presence;
pub mod protocol;
pub mod ws;
