//! Emberlink Connectivity Core
//!
//! Client-side real-time connectivity core for the Emberlink dating
//! application: a persistent publish/subscribe connection multiplexing
//! per-chat, per-user, and presence channels, plus the outbound request
//! pipeline fronting every REST call.
//!
//! # Features
//!
//! - **Connection management**: finite reconnection state machine with
//!   bounded exponential backoff, id-correlated heartbeat latency probing,
//!   and a typed event API
//! - **Quality-adaptive channels**: the number of open channels follows
//!   measured connection quality, with priority-aware eviction
//! - **Request pipeline**: signature deduplication, GET response caching,
//!   priority queueing, retry with jitter, and single-flight token refresh
//! - **Offline resilience**: outbound actions buffer across disconnects
//!   and replay in order on reconnect
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use emberlink::prelude::*;
//!
//! # async fn example() -> emberlink::Result<()> {
//! let mut config = CoreConfig::default();
//! config.api.base_url = "https://api.emberlink.example".to_string();
//! config.realtime.app_key = "emberlink-app".to_string();
//! config.validate()?;
//!
//! let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
//! let tokens = TokenStore::new(storage);
//! let transport = Arc::new(ReqwestTransport::new(&config.api)?);
//! let pipeline = RequestPipeline::new(config.api.clone(), transport, tokens);
//!
//! let connection = ConnectionManager::new(
//!     config,
//!     pipeline,
//!     Arc::new(WsTransport::new()),
//!     Collaborators::default(),
//! );
//! connection.start().await?;
//! connection.subscribe_chat("chat-42", ChannelPriority::High).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// =============================================================================
// Global Clippy Lint Suppressions
// =============================================================================
// - module_name_repetitions: common library naming pattern (ConnectionState
//   in connection module)
// - missing_errors_doc / missing_panics_doc: too verbose to document every
//   Result-returning function
// - must_use_candidate: not all return values need #[must_use]
// - cast_possible_truncation / cast_precision_loss / cast_sign_loss: common
//   in timestamp and delay arithmetic (i64 <-> u64 <-> f64)
// =============================================================================
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

// Re-exports of external dependencies
pub use serde;
pub use serde_json;

// Core modules
pub mod batching;
pub mod channels;
pub mod compat;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod logging;
pub mod presence;
pub mod push;
pub mod repo;
pub mod retry;
pub mod storage;

// Test utilities (available in dev-dependencies context)
#[cfg(any(test, feature = "test-utils", debug_assertions))]
pub mod test_support;

// Re-exports of core types for convenience
pub use batching::{
    BatchedSignal, BatchingConfig, BatchingManager, BatchingStats, RealtimeSignalSink, SignalSink,
    SignalType,
};
pub use channels::{ChannelInfo, ChannelManager, ChannelPriority, ChannelRelease};
pub use config::{ApiConfig, CoreConfig, PushConfig, RealtimeConfig};
pub use connection::{
    ChannelAuth, Collaborators, ConnectionManager, ConnectionMetrics, ConnectionQuality,
    ConnectionState, EventDispatcher, EventKind, EventListener, ListenerId, MetricsSnapshot,
    OutboundKind, OutboundQueue, PubSubConnection, PubSubTransport, QueuedOutboundMessage,
    RealtimeEvent, WireEvent, WsTransport,
};
pub use error::{Error, NetworkError, Result};
pub use http::{
    ApiResponse, HttpMethod, HttpTransport, PriorityClassifier, RequestOptions, RequestPipeline,
    RequestPriority, RequestSignature, UploadPart,
};
pub use presence::PresenceManager;
pub use push::{LogPresenter, NotificationPresenter};
pub use repo::NotificationCounterRepository;
pub use retry::{RetryConfig, RetryPolicy, RetryStrategy};
pub use storage::{KeyValueStorage, MemoryStorage, TokenStore};

/// Prelude module for convenient imports
///
/// Import everything you need with:
/// ```rust
/// use emberlink::prelude::*;
/// ```
pub mod prelude {
    pub use crate::batching::{BatchingConfig, BatchingManager, SignalSink, SignalType};
    pub use crate::channels::{ChannelManager, ChannelPriority};
    pub use crate::config::{ApiConfig, CoreConfig, RealtimeConfig};
    pub use crate::connection::{
        Collaborators, ConnectionManager, ConnectionQuality, ConnectionState, EventKind,
        RealtimeEvent, WsTransport,
    };
    pub use crate::error::{Error, Result};
    pub use crate::http::{
        ApiResponse, ReqwestTransport, RequestOptions, RequestPipeline, RequestPriority,
    };
    pub use crate::logging::{LogConfig, LogFormat, LogLevel, init_logging, try_init_logging};
    pub use crate::presence::PresenceManager;
    pub use crate::retry::{RetryConfig, RetryPolicy, RetryStrategy};
    pub use crate::storage::{KeyValueStorage, MemoryStorage, TokenStore};
    pub use serde::{Deserialize, Serialize};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "emberlink");
    }
}
