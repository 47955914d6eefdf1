//! Core configuration.
//!
//! All externally supplied settings (REST base URL, realtime app key and
//! cluster, push project id, timeout knobs) live here. The core is an
//! explicitly constructed service object: configuration is passed in at
//! build time, never read from globals.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default request timeout for plain REST calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for multipart uploads.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Default TTL for cached GET responses.
pub const DEFAULT_RESPONSE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default ceiling on simultaneously in-flight requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;

/// REST backend configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the REST backend, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Versioned API prefix applied to relative paths.
    pub api_prefix: String,
    /// Timeout for a single REST call (including retries).
    pub request_timeout: Duration,
    /// Timeout for multipart uploads.
    pub upload_timeout: Duration,
    /// TTL for the GET response cache.
    pub response_cache_ttl: Duration,
    /// Maximum number of simultaneously in-flight requests.
    pub max_concurrent_requests: usize,
    /// Whether requests are routed through the priority queue.
    pub prioritization_enabled: bool,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_prefix: "/api/v1".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            response_cache_ttl: DEFAULT_RESPONSE_CACHE_TTL,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            prioritization_enabled: true,
            user_agent: "emberlink/0.3".to_string(),
        }
    }
}

impl ApiConfig {
    /// Resolves a request path against the base URL and API prefix.
    ///
    /// Absolute URLs pass through untouched so callers can hit CDN or
    /// third-party endpoints through the same pipeline.
    #[must_use]
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let prefix = self.api_prefix.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{prefix}{path}")
        } else {
            format!("{base}{prefix}/{path}")
        }
    }
}

/// Realtime (pub/sub) backend configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Application key issued by the pub/sub backend.
    pub app_key: String,
    /// Cluster identifier, e.g. `eu`.
    pub cluster: String,
    /// Explicit WebSocket URL override. When empty, the URL is derived
    /// from `app_key` and `cluster`.
    pub ws_url: String,
    /// Backend endpoint (relative path) that signs private/presence
    /// channel subscriptions.
    pub auth_endpoint: String,
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout: u64,
    /// Heartbeat ping interval in milliseconds.
    pub heartbeat_interval: u64,
    /// How long to wait for a pong before degrading quality, in milliseconds.
    pub pong_timeout: u64,
    /// Maximum reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound message queue buffered across disconnects.
    pub outbound_queue_capacity: usize,
    /// Per-entry retry budget for buffered outbound messages.
    pub outbound_max_retries: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            cluster: "mt1".to_string(),
            ws_url: String::new(),
            auth_endpoint: "/realtime/auth".to_string(),
            connect_timeout: 10_000,
            heartbeat_interval: 30_000,
            pong_timeout: 5_000,
            max_reconnect_attempts: 10,
            outbound_queue_capacity: 100,
            outbound_max_retries: 3,
        }
    }
}

impl RealtimeConfig {
    /// Returns the WebSocket endpoint, deriving it from the app key and
    /// cluster when no explicit override is set.
    #[must_use]
    pub fn endpoint(&self) -> String {
        if !self.ws_url.is_empty() {
            return self.ws_url.clone();
        }
        format!(
            "wss://ws-{}.pusher-ws.example.com/app/{}?protocol=7",
            self.cluster, self.app_key
        )
    }
}

/// Push notification configuration.
#[derive(Debug, Clone, Default)]
pub struct PushConfig {
    /// Push project identifier, supplied by the embedding application.
    pub project_id: String,
}

/// Top-level configuration for the connectivity core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// REST backend settings.
    pub api: ApiConfig,
    /// Pub/sub backend settings.
    pub realtime: RealtimeConfig,
    /// Push notification settings.
    pub push: PushConfig,
}

impl CoreConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when a required field is missing
    /// or a knob is out of its sane range.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.is_empty() {
            return Err(Error::invalid_request("api.base_url must be set"));
        }
        if self.realtime.app_key.is_empty() && self.realtime.ws_url.is_empty() {
            return Err(Error::invalid_request(
                "realtime.app_key or realtime.ws_url must be set",
            ));
        }
        if self.api.max_concurrent_requests == 0 {
            return Err(Error::invalid_request(
                "api.max_concurrent_requests must be at least 1",
            ));
        }
        if self.realtime.pong_timeout >= self.realtime.heartbeat_interval {
            return Err(Error::invalid_request(
                "realtime.pong_timeout must be shorter than the heartbeat interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> CoreConfig {
        CoreConfig {
            api: ApiConfig {
                base_url: "https://api.example.com".to_string(),
                ..Default::default()
            },
            realtime: RealtimeConfig {
                app_key: "app-key-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_base_url() {
        let mut config = valid_config();
        config.api.base_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_pong_timeout_bound() {
        let mut config = valid_config();
        config.realtime.pong_timeout = config.realtime.heartbeat_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_paths() {
        let api = ApiConfig {
            base_url: "https://api.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            api.resolve("/profile/me"),
            "https://api.example.com/api/v1/profile/me"
        );
        assert_eq!(
            api.resolve("chats"),
            "https://api.example.com/api/v1/chats"
        );
        assert_eq!(
            api.resolve("https://cdn.example.com/photo.jpg"),
            "https://cdn.example.com/photo.jpg"
        );
    }

    #[test]
    fn test_realtime_endpoint_derivation() {
        let rt = RealtimeConfig {
            app_key: "k1".to_string(),
            cluster: "eu".to_string(),
            ..Default::default()
        };
        assert!(rt.endpoint().contains("ws-eu"));
        assert!(rt.endpoint().contains("k1"));

        let explicit = RealtimeConfig {
            ws_url: "wss://localhost:9443/app/test".to_string(),
            ..Default::default()
        };
        assert_eq!(explicit.endpoint(), "wss://localhost:9443/app/test");
    }
}
