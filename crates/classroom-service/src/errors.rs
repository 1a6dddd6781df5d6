//! Classroom service error types.
//!
//! Every handler failure is converted into a scoped `error` event for the
//! originating connection. Internal details are logged server-side but never
//! sent to clients.

use thiserror::Error;

/// Classroom service error type.
///
/// Maps to signaling error codes:
/// - `Validation`: `INVALID_REQUEST` (1)
/// - `Unauthorized`: `UNAUTHORIZED` (2)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `Conflict`: `CONFLICT` (5)
/// - `Internal`, `Config`: `INTERNAL_ERROR` (6)
/// - `StoreUnavailable`, `BackendUnavailable`: `UNAVAILABLE` (7, retriable)
/// - `IncompatibleCapabilities`: `INCOMPATIBLE_CAPABILITIES` (8)
/// - `Timeout`: `TIMEOUT` (9, retriable)
#[derive(Debug, Error)]
pub enum CsError {
    /// Malformed inbound payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Room, transport, producer, consumer or participant is unknown.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Router rejected a consume because the capabilities do not match.
    #[error("Incompatible RTP capabilities: {0}")]
    IncompatibleCapabilities(String),

    /// Collaborator rejected the session, or the caller acted outside its binding.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Presence store or event bus backbone is unreachable.
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// Backend persistence API is unreachable or returned a server error.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Operation conflicts with current state (e.g., transport already connected).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A media or collaborator call exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CsError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            CsError::Validation(_) => 1,   // INVALID_REQUEST
            CsError::Unauthorized(_) => 2, // UNAUTHORIZED
            CsError::NotFound(_) => 4,     // NOT_FOUND
            CsError::Conflict(_) => 5,     // CONFLICT
            CsError::Internal(_) | CsError::Config(_) => 6, // INTERNAL_ERROR
            CsError::StoreUnavailable(_) | CsError::BackendUnavailable(_) => 7, // UNAVAILABLE
            CsError::IncompatibleCapabilities(_) => 8, // INCOMPATIBLE_CAPABILITIES
            CsError::Timeout(_) => 9,      // TIMEOUT
        }
    }

    /// Whether the client may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CsError::StoreUnavailable(_) | CsError::BackendUnavailable(_) | CsError::Timeout(_)
        )
    }

    /// Returns a bounded label string for the error variant (for metrics).
    pub fn error_type_label(&self) -> &'static str {
        match self {
            CsError::Validation(_) => "validation",
            CsError::NotFound(_) => "not_found",
            CsError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            CsError::Unauthorized(_) => "unauthorized",
            CsError::StoreUnavailable(_) => "store_unavailable",
            CsError::BackendUnavailable(_) => "backend_unavailable",
            CsError::Conflict(_) => "conflict",
            CsError::Timeout(_) => "timeout",
            CsError::Config(_) => "config",
            CsError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CsError::Internal(_) | CsError::Config(_) => "An internal error occurred".to_string(),
            CsError::StoreUnavailable(_) => {
                "Session state is temporarily unavailable, please retry".to_string()
            }
            CsError::BackendUnavailable(_) => {
                "The classroom backend is temporarily unavailable, please retry".to_string()
            }
            CsError::Timeout(_) => "The operation timed out, please retry".to_string(),
            CsError::IncompatibleCapabilities(_) => {
                "Cannot consume this producer with the given RTP capabilities".to_string()
            }
            CsError::Validation(msg)
            | CsError::NotFound(msg)
            | CsError::Unauthorized(msg)
            | CsError::Conflict(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(CsError::Validation("bad".to_string()).error_code(), 1);
        assert_eq!(CsError::Unauthorized("nope".to_string()).error_code(), 2);
        assert_eq!(CsError::NotFound("transport".to_string()).error_code(), 4);
        assert_eq!(CsError::Conflict("connected".to_string()).error_code(), 5);
        assert_eq!(CsError::Internal("boom".to_string()).error_code(), 6);
        assert_eq!(CsError::Config("missing".to_string()).error_code(), 6);
        assert_eq!(
            CsError::StoreUnavailable("redis down".to_string()).error_code(),
            7
        );
        assert_eq!(
            CsError::IncompatibleCapabilities("no codec".to_string()).error_code(),
            8
        );
        assert_eq!(CsError::Timeout("consume".to_string()).error_code(), 9);
    }

    #[test]
    fn test_only_transient_errors_are_retriable() {
        assert!(CsError::StoreUnavailable("x".to_string()).is_retriable());
        assert!(CsError::Timeout("x".to_string()).is_retriable());
        assert!(CsError::BackendUnavailable("x".to_string()).is_retriable());
        assert!(!CsError::NotFound("x".to_string()).is_retriable());
        assert!(!CsError::Validation("x".to_string()).is_retriable());
        assert!(!CsError::IncompatibleCapabilities("x".to_string()).is_retriable());
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err =
            CsError::StoreUnavailable("connection refused at 10.0.0.12:6379".to_string());
        assert!(!store_err.client_message().contains("10.0.0.12"));

        let internal = CsError::Internal("engine worker 3 crashed".to_string());
        assert_eq!(internal.client_message(), "An internal error occurred");

        let timeout = CsError::Timeout("backend http://backend:3001 slow".to_string());
        assert!(!timeout.client_message().contains("backend:3001"));

        let incompatible = CsError::IncompatibleCapabilities("video/H265".to_string());
        assert!(!incompatible.client_message().contains("H265"));
    }

    #[test]
    fn test_client_errors_pass_message_through() {
        let err = CsError::NotFound("transport not found".to_string());
        assert_eq!(err.client_message(), "transport not found");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", CsError::StoreUnavailable("timeout".to_string())),
            "Coordination store unavailable: timeout"
        );
        assert_eq!(
            format!("{}", CsError::Validation("classId is required".to_string())),
            "Validation failed: classId is required"
        );
    }

    #[test]
    fn test_error_type_labels_are_distinct() {
        let labels = [
            CsError::Validation(String::new()).error_type_label(),
            CsError::NotFound(String::new()).error_type_label(),
            CsError::IncompatibleCapabilities(String::new()).error_type_label(),
            CsError::Unauthorized(String::new()).error_type_label(),
            CsError::StoreUnavailable(String::new()).error_type_label(),
            CsError::BackendUnavailable(String::new()).error_type_label(),
            CsError::Conflict(String::new()).error_type_label(),
            CsError::Timeout(String::new()).error_type_label(),
            CsError::Config(String::new()).error_type_label(),
            CsError::Internal(String::new()).error_type_label(),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
