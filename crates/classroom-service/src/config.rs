//! Classroom service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default number of media workers routers are spread across.
pub const DEFAULT_MEDIA_WORKERS: usize = 4;

/// Default IP announced in ICE candidates.
pub const DEFAULT_MEDIA_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default deadline for media engine and backend calls, in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5000;

/// Default time an empty room keeps its router before eviction.
pub const DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS: u64 = 300;

/// Default interval between idle room sweeps.
pub const DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS: u64 = 30;

/// Default node id prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "cs";

/// Backend used for presence and cross-process fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationBackend {
    /// Redis sets/hashes for presence, Redis pub/sub for fan-out.
    Redis,
    /// Process-local state. Single-node deployments and tests only.
    Memory,
}

impl CoordinationBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinationBackend::Redis => "redis",
            CoordinationBackend::Memory => "memory",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Parse `CS_LOG_FORMAT`; anything but `json` means text.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Classroom service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Presence/fan-out backend (default: redis).
    pub coordination_backend: CoordinationBackend,

    /// Redis connection URL. Required when the backend is `redis`.
    /// Protected by `SecretString` since it may embed a password.
    pub redis_url: Option<SecretString>,

    /// Base URL of the backend persistence API (users, classes, attendance, chat).
    pub backend_api_url: String,

    /// Bearer token presented to the backend API.
    pub backend_service_token: SecretString,

    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this process, stamped on cross-node events.
    pub node_id: String,

    /// Number of media workers (default: 4).
    pub media_workers: usize,

    /// IP announced in ICE candidates (default: "127.0.0.1").
    pub media_announced_ip: String,

    /// Deadline for a single media engine or backend call.
    pub call_timeout: Duration,

    /// How long an empty room keeps its router before eviction.
    pub room_idle_timeout: Duration,

    /// Interval between idle room sweeps.
    pub room_sweep_interval: Duration,

    pub log_format: LogFormat,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("coordination_backend", &self.coordination_backend)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("backend_api_url", &self.backend_api_url)
            .field("backend_service_token", &"[REDACTED]")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("node_id", &self.node_id)
            .field("media_workers", &self.media_workers)
            .field("media_announced_ip", &self.media_announced_ip)
            .field("call_timeout", &self.call_timeout)
            .field("room_idle_timeout", &self.room_idle_timeout)
            .field("room_sweep_interval", &self.room_sweep_interval)
            .field("log_format", &self.log_format)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let coordination_backend = match vars.get("CS_COORDINATION_BACKEND").map(String::as_str) {
            None | Some("redis") => CoordinationBackend::Redis,
            Some("memory") => CoordinationBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "CS_COORDINATION_BACKEND must be 'redis' or 'memory', got '{other}'"
                )))
            }
        };

        let redis_url = vars.get("REDIS_URL").cloned().map(SecretString::from);
        if coordination_backend == CoordinationBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let backend_api_url = vars
            .get("BACKEND_API_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("BACKEND_API_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let backend_service_token = SecretString::from(
            vars.get("BACKEND_SERVICE_TOKEN")
                .ok_or_else(|| ConfigError::MissingEnvVar("BACKEND_SERVICE_TOKEN".to_string()))?
                .clone(),
        );

        let signaling_bind_address = vars
            .get("CS_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("CS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let media_workers = vars
            .get("CS_MEDIA_WORKERS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MEDIA_WORKERS);
        if media_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "CS_MEDIA_WORKERS must be at least 1".to_string(),
            ));
        }

        let media_announced_ip = vars
            .get("CS_MEDIA_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEDIA_ANNOUNCED_IP.to_string());

        let call_timeout_ms = vars
            .get("CS_CALL_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
        if call_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CS_CALL_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        let room_idle_timeout_seconds = vars
            .get("CS_ROOM_IDLE_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS);

        let room_sweep_interval_seconds = vars
            .get("CS_ROOM_SWEEP_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ROOM_SWEEP_INTERVAL_SECONDS)
            .max(1);

        let node_id = vars.get("CS_NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let log_format = LogFormat::parse(vars.get("CS_LOG_FORMAT").map(String::as_str));

        Ok(Config {
            coordination_backend,
            redis_url,
            backend_api_url,
            backend_service_token,
            signaling_bind_address,
            health_bind_address,
            node_id,
            media_workers,
            media_announced_ip,
            call_timeout: Duration::from_millis(call_timeout_ms),
            room_idle_timeout: Duration::from_secs(room_idle_timeout_seconds),
            room_sweep_interval: Duration::from_secs(room_sweep_interval_seconds),
            log_format,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "REDIS_URL".to_string(),
                "redis://:cache-pass@localhost:6379".to_string(),
            ),
            (
                "BACKEND_API_URL".to_string(),
                "http://backend:3001/".to_string(),
            ),
            (
                "BACKEND_SERVICE_TOKEN".to_string(),
                "svc-token-abcdef".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.coordination_backend, CoordinationBackend::Redis);
        assert_eq!(
            config.redis_url.as_ref().map(|u| u.expose_secret().to_string()),
            Some("redis://:cache-pass@localhost:6379".to_string())
        );
        assert_eq!(config.backend_api_url, "http://backend:3001");
        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.media_workers, DEFAULT_MEDIA_WORKERS);
        assert_eq!(config.media_announced_ip, DEFAULT_MEDIA_ANNOUNCED_IP);
        assert_eq!(
            config.call_timeout,
            Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)
        );
        assert_eq!(
            config.room_idle_timeout,
            Duration::from_secs(DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS)
        );
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.node_id.starts_with("cs-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "CS_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:4000".to_string(),
        );
        vars.insert("CS_NODE_ID".to_string(), "cs-node-7".to_string());
        vars.insert("CS_MEDIA_WORKERS".to_string(), "2".to_string());
        vars.insert("CS_CALL_TIMEOUT_MS".to_string(), "750".to_string());
        vars.insert("CS_ROOM_IDLE_TIMEOUT_SECONDS".to_string(), "60".to_string());
        vars.insert("CS_ROOM_SWEEP_INTERVAL_SECONDS".to_string(), "5".to_string());
        vars.insert("CS_LOG_FORMAT".to_string(), "JSON".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:4000");
        assert_eq!(config.node_id, "cs-node-7");
        assert_eq!(config.media_workers, 2);
        assert_eq!(config.call_timeout, Duration::from_millis(750));
        assert_eq!(config.room_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.room_sweep_interval, Duration::from_secs(5));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_memory_backend_does_not_need_redis() {
        let mut vars = base_vars();
        vars.remove("REDIS_URL");
        vars.insert("CS_COORDINATION_BACKEND".to_string(), "memory".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.coordination_backend, CoordinationBackend::Memory);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_from_vars_missing_redis_url() {
        let mut vars = base_vars();
        vars.remove("REDIS_URL");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_from_vars_missing_backend_token() {
        let mut vars = base_vars();
        vars.remove("BACKEND_SERVICE_TOKEN");

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "BACKEND_SERVICE_TOKEN")
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let mut vars = base_vars();
        vars.insert("CS_COORDINATION_BACKEND".to_string(), "etcd".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let mut vars = base_vars();
        vars.insert("CS_MEDIA_WORKERS".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("cache-pass"));
        assert!(!debug_output.contains("svc-token-abcdef"));
        assert!(debug_output.contains("http://backend:3001"));
    }
}
