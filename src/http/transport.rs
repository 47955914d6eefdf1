//! HTTP transport abstraction.
//!
//! The pipeline's policy layer (dedup, priority, retry, token refresh) is
//! written against [`HttpTransport`]; [`ReqwestTransport`] is the
//! production implementation. Tests inject a scripted mock instead of a
//! server.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::ApiConfig;
use crate::error::{Error, NetworkError, Result};

/// HTTP method of a prepared request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Canonical upper-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadPart {
    /// Form field name.
    pub name: String,
    /// File name reported to the server.
    pub file_name: String,
    /// MIME type of the content.
    pub mime_type: String,
    /// Raw content.
    pub data: Vec<u8>,
}

/// Body of a prepared request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// JSON body.
    Json(Value),
    /// Multipart form upload.
    Multipart(Vec<UploadPart>),
}

/// A fully resolved request, ready for the transport.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Query parameters appended to the URL.
    pub query: Vec<(String, String)>,
    /// Extra headers (authorization is attached here by the pipeline).
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: RequestBody,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Raw transport response: status plus body bytes.
///
/// The pipeline owns interpretation (JSON parse, error normalization);
/// the transport only moves bytes.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Attempts to parse the body as JSON.
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Body as text (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the status is in the 2xx range.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport executing a single HTTP exchange. No retry, no caching, no
/// auth. All policy lives in the pipeline.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Executes the request, returning the raw response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when no response could be obtained
    /// (connect failure, timeout, TLS). An HTTP error status is NOT an
    /// error at this layer.
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse>;
}

/// Production transport over `reqwest`.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds the transport from the API configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be constructed.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn method_of(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    fn classify(err: &reqwest::Error) -> NetworkError {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_connect() {
            NetworkError::ConnectionFailed(err.to_string())
        } else {
            NetworkError::ConnectionClosed(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse> {
        let mut builder = self
            .client
            .request(Self::method_of(request.method), &request.url)
            .timeout(request.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    let file = reqwest::multipart::Part::bytes(part.data)
                        .file_name(part.file_name)
                        .mime_str(&part.mime_type)
                        .map_err(|e| Error::invalid_request(format!("Invalid MIME type: {e}")))?;
                    form = form.part(part.name, file);
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await.map_err(|e| {
            error!(url = %request.url, error = %e, "HTTP request send failed");
            Error::from(Self::classify(&e))
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                error!(url = %request.url, error = %e, "Failed to read response body");
                Error::from(NetworkError::ConnectionClosed(e.to_string()))
            })?
            .to_vec();

        debug!(
            url = %request.url,
            status,
            body_len = body.len(),
            "HTTP response received"
        );

        Ok(RawResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(HttpMethod::Get.as_str(), "GET");
        assert_eq!(HttpMethod::Patch.as_str(), "PATCH");
    }

    #[test]
    fn test_raw_response_accessors() {
        let response = RawResponse {
            status: 200,
            body: br#"{"ok":true}"#.to_vec(),
        };
        assert!(response.is_success());
        assert_eq!(response.json().unwrap()["ok"], true);

        let failure = RawResponse {
            status: 503,
            body: b"unavailable".to_vec(),
        };
        assert!(!failure.is_success());
        assert!(failure.json().is_none());
        assert_eq!(failure.text(), "unavailable");
    }

    #[test]
    fn test_reqwest_transport_builds() {
        let transport = ReqwestTransport::new(&ApiConfig::default());
        assert!(transport.is_ok());
    }
}
