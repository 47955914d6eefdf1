//! Error handling for the emberlink connectivity core.
//!
//! Design principles, following the taxonomy the rest of the crate is built
//! around:
//!
//! 1. **Type Safety**: strongly-typed errors via `thiserror`
//! 2. **API Stability**: public enums are `#[non_exhaustive]`
//! 3. **Context Rich**: error-chain support with context attachment
//! 4. **Performance**: `Cow<'static, str>` messages, boxed large variants
//! 5. **Fan-out**: `Error` is `Clone`, so one outcome of a deduplicated
//!    request can be handed to every caller that shares the in-flight future
//!
//! ## Taxonomy
//!
//! ```text
//! Error
//! ├── Network         - transport-level failures (via NetworkError)
//! ├── Api             - HTTP error responses carrying the server payload
//! ├── Authentication  - credential problems short of session loss
//! ├── SessionExpired  - token refresh failed; credentials were purged
//! ├── RateLimit       - throttled, with optional retry-after
//! ├── Timeout         - operation deadline exceeded
//! ├── Cancelled       - evicted from a queue / token cancelled (not a failure)
//! ├── ResourceExhausted - capacity limit (channel budget, queue bound)
//! ├── Transport       - pub/sub transport protocol errors
//! ├── Parse           - wire payload failed boundary validation
//! ├── Storage         - durable key-value store failures
//! ├── InvalidRequest  - caller-side misuse
//! └── Context         - wrapper preserving the error chain
//! ```

mod network;

pub use network::NetworkError;

use serde_json::Value;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for all emberlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type for the emberlink connectivity core.
///
/// All variants are cloneable: the request pipeline deduplicates identical
/// in-flight calls, and every waiting caller receives a clone of the single
/// outcome.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Network-level failure: no usable response from the server.
    #[error("Network error: {0}")]
    Network(Box<NetworkError>),

    /// HTTP error response with the server-provided message and payload.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code of the response
        status: u16,
        /// Human-readable message (server-provided when present)
        message: Cow<'static, str>,
        /// Raw server payload, if the body parsed as JSON
        payload: Option<Box<Value>>,
    },

    /// Authentication problem (missing or rejected credential).
    #[error("Authentication error: {0}")]
    Authentication(Cow<'static, str>),

    /// The session could not be refreshed and local credentials were purged.
    ///
    /// Distinct from [`Error::Authentication`] so the application can route
    /// straight to a re-authentication flow.
    #[error("Session expired: {0}")]
    SessionExpired(Cow<'static, str>),

    /// Rate limit exceeded, with optional retry-after hint.
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        /// Error message
        message: Cow<'static, str>,
        /// Optional duration to wait before retrying
        retry_after: Option<Duration>,
    },

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(Cow<'static, str>),

    /// Operation was cancelled (priority-queue eviction, token cancellation).
    ///
    /// This is a distinct outcome, not a failure: it is never logged as an
    /// error and never retried.
    #[error("Cancelled: {0}")]
    Cancelled(Cow<'static, str>),

    /// A capacity limit was reached (channel budget, bounded queue).
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(Cow<'static, str>),

    /// Pub/sub transport protocol error.
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// A wire payload failed validation at the ingress boundary.
    #[error("Parse error: {0}")]
    Parse(Cow<'static, str>),

    /// Durable key-value storage failure.
    #[error("Storage error: {0}")]
    Storage(Cow<'static, str>),

    /// Invalid request parameters (caller-side).
    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    /// Error with additional context, preserving the chain.
    #[error("{context}")]
    Context {
        /// Context message describing what operation failed
        context: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    // ==================== Constructor Methods ====================

    /// Creates a network error from a message.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(Box::new(NetworkError::ConnectionFailed(msg.into())))
    }

    /// Creates an API error from an HTTP status and server message.
    pub fn api(status: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Api {
            status,
            message: message.into(),
            payload: None,
        }
    }

    /// Creates an API error carrying the raw server payload.
    pub fn api_with_payload(
        status: u16,
        message: impl Into<Cow<'static, str>>,
        payload: Value,
    ) -> Self {
        Self::Api {
            status,
            message: message.into(),
            payload: Some(Box::new(payload)),
        }
    }

    /// Creates an authentication error.
    pub fn authentication(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Creates a session-expired error.
    pub fn session_expired(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::SessionExpired(msg.into())
    }

    /// Creates a rate limit error with an optional retry hint.
    pub fn rate_limit(
        message: impl Into<Cow<'static, str>>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a cancelled outcome.
    pub fn cancelled(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Creates a resource exhausted error.
    pub fn resource_exhausted(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Creates a pub/sub transport error.
    pub fn transport(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a parse error.
    pub fn parse(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Parse(msg.into())
    }

    /// Creates a storage error.
    pub fn storage(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates an invalid request error.
    pub fn invalid_request(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    // ==================== Context Methods ====================

    /// Attaches context to an existing error.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Internal helper: iterator over the error chain, penetrating
    /// `Context` layers.
    fn iter_chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |err| match err {
            Error::Context { source, .. } => Some(source.as_ref()),
            _ => None,
        })
    }

    /// Returns the root cause of the error, skipping `Context` layers.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        self.iter_chain().last().unwrap_or(self)
    }

    /// Generates a report with the full error chain.
    #[must_use]
    pub fn report(&self) -> String {
        use std::error::Error as StdError;
        use std::fmt::Write;
        let mut report = String::new();
        report.push_str(&self.to_string());

        let mut current: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = current {
            let _ = write!(report, "\nCaused by: {err}");
            current = err.source();
        }
        report
    }

    // ==================== Predicates (Context Penetrating) ====================

    /// Checks if this error is worth retrying.
    ///
    /// Transient network failures, rate limits, and timeouts are retryable.
    /// API errors are evaluated by the retry policy against its retryable
    /// status set; here only the transport-level view is reported.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(ne) => ne.is_transient(),
            Error::RateLimit { .. } | Error::Timeout(_) => true,
            Error::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns the retry delay if this is a rate limit error.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit { retry_after, .. } => *retry_after,
            Error::Context { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Returns the HTTP status if this is an API error.
    #[must_use]
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Context { source, .. } => source.api_status(),
            _ => None,
        }
    }

    /// Checks if this is a cancelled outcome; returns the message.
    #[must_use]
    pub fn as_cancelled(&self) -> Option<&str> {
        match self {
            Error::Cancelled(msg) => Some(msg.as_ref()),
            Error::Context { source, .. } => source.as_cancelled(),
            _ => None,
        }
    }

    /// Checks if this is an authentication error; returns the message.
    #[must_use]
    pub fn as_authentication(&self) -> Option<&str> {
        match self {
            Error::Authentication(msg) => Some(msg.as_ref()),
            Error::Context { source, .. } => source.as_authentication(),
            _ => None,
        }
    }

    /// Checks if this is a session-expired error; returns the message.
    #[must_use]
    pub fn as_session_expired(&self) -> Option<&str> {
        match self {
            Error::SessionExpired(msg) => Some(msg.as_ref()),
            Error::Context { source, .. } => source.as_session_expired(),
            _ => None,
        }
    }

    /// Checks if this is a resource exhausted error; returns the message.
    #[must_use]
    pub fn as_resource_exhausted(&self) -> Option<&str> {
        match self {
            Error::ResourceExhausted(msg) => Some(msg.as_ref()),
            Error::Context { source, .. } => source.as_resource_exhausted(),
            _ => None,
        }
    }
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        Self::Network(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(Cow::Owned(err.to_string()))
    }
}
