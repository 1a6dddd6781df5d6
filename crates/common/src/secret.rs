//! Redacting wrappers for sensitive configuration values.
//!
//! Re-exports the [`secrecy`] types used across the classroom services. Any
//! value that could carry a credential goes through these wrappers:
//!
//! - Redis connection URLs (`redis://:password@host:6379`)
//! - Backend service tokens sent as bearer credentials
//!
//! `SecretString` implements `Debug` with redaction, so structs that derive
//! `Debug` stay safe to log. The inner value is only reachable through an
//! explicit `expose_secret()` call, which keeps every use site greppable.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct BackendCredentials {
//!     base_url: String,
//!     service_token: SecretString,
//! }
//!
//! let creds = BackendCredentials {
//!     base_url: "http://backend:3001".to_string(),
//!     service_token: SecretString::from("svc-token"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("svc-token"));
//! assert_eq!(creds.service_token.expose_secret(), "svc-token");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("service-token-123");
        assert_eq!(secret.expose_secret(), "service-token-123");
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct BackendSettings {
            base_url: String,
            service_token: SecretString,
        }

        let json = r#"{"base_url": "http://backend", "service_token": "tok-abc"}"#;
        let settings: BackendSettings = serde_json::from_str(json).expect("deserialize");

        assert_eq!(settings.service_token.expose_secret(), "tok-abc");
        let debug = format!("{settings:?}");
        assert!(debug.contains("http://backend"));
        assert!(!debug.contains("tok-abc"));
    }
}
