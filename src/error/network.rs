//! Network-related error types.

use thiserror::Error;

/// Encapsulated network errors hiding transport implementation details.
///
/// This type wraps all network-level failures without exposing third-party
/// library types (like `reqwest::Error` or `tungstenite::Error`) in the
/// public API, so the HTTP and pub/sub transports can change underneath
/// without breaking callers.
///
/// # Retryable Errors
///
/// The following variants are considered retryable by the retry policy:
/// - [`NetworkError::Timeout`]
/// - [`NetworkError::ConnectionFailed`]
/// - [`NetworkError::ConnectionClosed`]
/// - [`NetworkError::DnsResolution`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetworkError {
    /// Request failed with an HTTP status code before a usable body arrived.
    #[error("Request failed with status {status}: {message}")]
    RequestFailed {
        /// HTTP status code
        status: u16,
        /// Error message
        message: String,
    },

    /// Request timed out.
    #[error("Request timeout")]
    Timeout,

    /// Connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was closed unexpectedly.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// DNS resolution failed.
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    /// SSL/TLS error.
    #[error("SSL/TLS error: {0}")]
    Tls(String),
}

impl NetworkError {
    /// Returns `true` if this failure may recover on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionFailed(_)
                | Self::ConnectionClosed(_)
                | Self::DnsResolution(_)
        )
    }
}
