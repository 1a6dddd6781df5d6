//! Observability for the classroom service.
//!
//! # Privacy by Default
//!
//! Async entry points use `#[instrument(skip_all)]` with an explicit allow-list
//! of identifier fields. Chat text, display names and credentials are never
//! recorded in spans or metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cs_connections_active` | Gauge | none | Open signaling connections |
//! | `cs_rooms_active` | Gauge | none | Rooms holding a media router |
//! | `cs_message_latency_seconds` | Histogram | `message_type` | Handler latency |
//! | `cs_handler_errors_total` | Counter | `message_type`, `error_type` | Errors returned to clients |
//! | `cs_handler_panics_total` | Counter | none | Isolated handler panics |
//! | `cs_store_latency_seconds` | Histogram | `operation` | Presence store latency |
//! | `cs_media_call_latency_seconds` | Histogram | `operation` | Media engine latency |
//! | `cs_backend_call_latency_seconds` | Histogram | `operation` | Backend collaborator latency |
//! | `cs_bus_events_dropped_total` | Counter | `reason` | Fan-out events not published |
//! | `cs_rooms_evicted_total` | Counter | none | Idle rooms torn down |

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use logging::init_tracing;
pub use metrics::init_metrics_recorder;
