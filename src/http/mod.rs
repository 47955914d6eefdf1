//! Outbound request pipeline.
//!
//! Every backend-bound HTTP call flows through [`RequestPipeline`]:
//! signature-based deduplication, a TTL response cache for GETs, priority
//! classification with a bounded dispatch queue, retry with backoff, and
//! single-flight bearer-token refresh. Failures are normalized into the
//! crate error taxonomy; cancellation surfaces as a distinct outcome.

mod cache;
mod priority;
mod signature;
mod transport;

pub use cache::ResponseCache;
pub use priority::{
    DEFAULT_QUEUE_CAPACITY, DispatchSlot, PriorityClassifier, PriorityQueue, RequestPriority,
};
pub use signature::RequestSignature;
pub use transport::{
    HttpMethod, HttpTransport, PreparedRequest, RawResponse, ReqwestTransport, RequestBody,
    UploadPart,
};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::storage::TokenStore;

/// Interval between polls while waiting on another caller's token refresh.
const REFRESH_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest a caller waits on another caller's token refresh.
const REFRESH_MAX_WAIT: Duration = Duration::from_secs(5);

/// A normalized successful response: status plus parsed JSON body.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code (always 2xx).
    pub status: u16,
    /// Parsed body; `Value::Null` for empty bodies, a JSON string for
    /// non-JSON bodies.
    pub body: Value,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the URL-derived priority tier.
    pub priority: Option<RequestPriority>,
    /// Skips the bearer token (login, refresh, public endpoints). Calls
    /// with this set never trigger a token refresh on 401.
    pub skip_auth: bool,
    /// Bypasses the GET response cache.
    pub bypass_cache: bool,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

type SharedOutcome = Shared<BoxFuture<'static, Result<ApiResponse>>>;

struct PipelineCore {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenStore,
    api: ApiConfig,
    classifier: PriorityClassifier,
    queue: Arc<PriorityQueue>,
    in_flight: dashmap::DashMap<String, SharedOutcome>,
    cache: ResponseCache,
    refresh_in_progress: AtomicBool,
    retry: RetryPolicy,
}

/// The outbound request pipeline. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RequestPipeline {
    core: Arc<PipelineCore>,
}

impl RequestPipeline {
    /// Creates a pipeline over the given transport and token store.
    pub fn new(api: ApiConfig, transport: Arc<dyn HttpTransport>, tokens: TokenStore) -> Self {
        let queue = PriorityQueue::new(api.max_concurrent_requests, DEFAULT_QUEUE_CAPACITY);
        let cache = ResponseCache::new(api.response_cache_ttl);
        Self {
            core: Arc::new(PipelineCore {
                transport,
                tokens,
                api,
                classifier: PriorityClassifier::new(),
                queue,
                in_flight: dashmap::DashMap::new(),
                cache,
                refresh_in_progress: AtomicBool::new(false),
                retry: RetryPolicy::for_requests(),
            }),
        }
    }

    /// Returns the token store backing this pipeline.
    pub fn tokens(&self) -> &TokenStore {
        &self.core.tokens
    }

    /// Drops all cached responses (logout, account switch).
    pub fn clear_cache(&self) {
        self.core.cache.clear();
    }

    /// Number of requests currently sharing in-flight futures.
    pub fn in_flight_len(&self) -> usize {
        self.core.in_flight.len()
    }

    // ==================== Verbs ====================

    /// Executes a GET request.
    #[instrument(name = "pipeline_get", skip(self, query, options), fields(path = %path))]
    pub async fn get(
        &self,
        path: &str,
        query: Option<Vec<(String, String)>>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.request(HttpMethod::Get, path, query, RequestBody::Empty, options)
            .await
    }

    /// Executes a POST request.
    #[instrument(name = "pipeline_post", skip(self, body, options), fields(path = %path))]
    pub async fn post(
        &self,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = body.map_or(RequestBody::Empty, RequestBody::Json);
        self.request(HttpMethod::Post, path, None, body, options)
            .await
    }

    /// Executes a PUT request.
    #[instrument(name = "pipeline_put", skip(self, body, options), fields(path = %path))]
    pub async fn put(
        &self,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = body.map_or(RequestBody::Empty, RequestBody::Json);
        self.request(HttpMethod::Put, path, None, body, options).await
    }

    /// Executes a PATCH request.
    #[instrument(name = "pipeline_patch", skip(self, body, options), fields(path = %path))]
    pub async fn patch(
        &self,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = body.map_or(RequestBody::Empty, RequestBody::Json);
        self.request(HttpMethod::Patch, path, None, body, options)
            .await
    }

    /// Executes a DELETE request.
    #[instrument(name = "pipeline_delete", skip(self, options), fields(path = %path))]
    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(HttpMethod::Delete, path, None, RequestBody::Empty, options)
            .await
    }

    /// Uploads files as a multipart form.
    #[instrument(name = "pipeline_upload", skip(self, parts, options), fields(path = %path, parts = parts.len()))]
    pub async fn upload(
        &self,
        path: &str,
        parts: Vec<UploadPart>,
        mut options: RequestOptions,
    ) -> Result<ApiResponse> {
        options.timeout = Some(options.timeout.unwrap_or(self.core.api.upload_timeout));
        self.request(
            HttpMethod::Post,
            path,
            None,
            RequestBody::Multipart(parts),
            options,
        )
        .await
    }

    /// Downloads a resource to the given destination, returning the number
    /// of bytes written. Downloads bypass dedup and the response cache.
    #[instrument(name = "pipeline_download", skip(self, dest, options), fields(url = %url))]
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        options: RequestOptions,
    ) -> Result<u64> {
        let core = &self.core;
        let resolved = core.api.resolve(url);
        let priority = options
            .priority
            .unwrap_or_else(|| core.classifier.classify(&resolved));

        let _slot = if core.api.prioritization_enabled {
            Some(Arc::clone(&core.queue).acquire(priority).await?)
        } else {
            None
        };

        let timeout = options.timeout.unwrap_or(core.api.upload_timeout);
        let mut attempt = 0u32;
        let raw = loop {
            let prepared = PreparedRequest {
                method: HttpMethod::Get,
                url: resolved.clone(),
                query: Vec::new(),
                headers: Self::base_headers(core, options.skip_auth).await,
                body: RequestBody::Empty,
                timeout,
            };
            match core.transport.execute(prepared).await {
                Ok(raw) if raw.is_success() => break raw,
                Ok(raw) => {
                    let err = Self::normalize_error(&raw);
                    if core.retry.should_retry(&err, attempt) {
                        sleep(core.retry.delay_for_attempt(attempt, Some(&err))).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    if core.retry.should_retry(&err, attempt) {
                        sleep(core.retry.delay_for_attempt(attempt, Some(&err))).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        };

        let len = raw.body.len() as u64;
        tokio::fs::write(dest, &raw.body)
            .await
            .map_err(|e| Error::storage(format!("Failed to write download: {e}")))?;
        Ok(len)
    }

    // ==================== Core flow ====================

    /// Shared entry point for all verbs: cache check, dedup, dispatch.
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        query: Option<Vec<(String, String)>>,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let core = Arc::clone(&self.core);
        let url = core.api.resolve(path);
        let signature = RequestSignature::compute(method, &url, query.as_deref(), &body);
        let cacheable = method == HttpMethod::Get && !options.bypass_cache;

        if cacheable {
            if let Some(hit) = core.cache.get(signature.as_str()) {
                return Ok(hit);
            }
        }

        // Check-then-insert happens inside one map entry operation, so two
        // concurrent identical calls cannot both miss
        let shared = {
            use dashmap::mapref::entry::Entry;
            match core.in_flight.entry(signature.as_str().to_string()) {
                Entry::Occupied(existing) => {
                    debug!(signature = %signature, "Joined in-flight request");
                    existing.get().clone()
                }
                Entry::Vacant(vacant) => {
                    let fut = Self::dispatch(
                        Arc::clone(&core),
                        method,
                        url,
                        query,
                        body,
                        options,
                        signature.as_str().to_string(),
                        cacheable,
                    )
                    .boxed()
                    .shared();
                    vacant.insert(fut.clone());
                    fut
                }
            }
        };

        shared.await
    }

    /// Runs one deduplicated request to completion, then clears its
    /// in-flight entry and populates the cache.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        core: Arc<PipelineCore>,
        method: HttpMethod,
        url: String,
        query: Option<Vec<(String, String)>>,
        body: RequestBody,
        options: RequestOptions,
        signature: String,
        cacheable: bool,
    ) -> Result<ApiResponse> {
        let result = Self::dispatch_inner(&core, method, &url, query, body, &options).await;

        core.in_flight.remove(&signature);

        if cacheable {
            if let Ok(response) = &result {
                core.cache.insert(signature, response.clone());
            }
        }

        result
    }

    async fn dispatch_inner(
        core: &Arc<PipelineCore>,
        method: HttpMethod,
        url: &str,
        query: Option<Vec<(String, String)>>,
        body: RequestBody,
        options: &RequestOptions,
    ) -> Result<ApiResponse> {
        let priority = options
            .priority
            .unwrap_or_else(|| core.classifier.classify(url));

        let _slot = if core.api.prioritization_enabled {
            Some(Arc::clone(&core.queue).acquire(priority).await?)
        } else {
            None
        };

        let timeout = options.timeout.unwrap_or(match body {
            RequestBody::Multipart(_) => core.api.upload_timeout,
            _ => core.api.request_timeout,
        });

        let query = query.unwrap_or_default();
        let mut attempt = 0u32;
        let mut refreshed = false;

        loop {
            let prepared = PreparedRequest {
                method,
                url: url.to_string(),
                query: query.clone(),
                headers: Self::base_headers(core, options.skip_auth).await,
                body: body.clone(),
                timeout,
            };

            let err = match core.transport.execute(prepared).await {
                Ok(raw) if raw.is_success() => {
                    let parsed = raw.json().unwrap_or_else(|| {
                        let text = raw.text();
                        if text.is_empty() {
                            Value::Null
                        } else {
                            Value::String(text)
                        }
                    });
                    return Ok(ApiResponse {
                        status: raw.status,
                        body: parsed,
                    });
                }
                Ok(raw) if raw.status == 401 && !options.skip_auth && !refreshed => {
                    refreshed = true;
                    Self::refresh_session(core).await?;
                    // Retry the original call once with the fresh token;
                    // the attempt counter is untouched
                    continue;
                }
                Ok(raw) => Self::normalize_error(&raw),
                Err(err) => err,
            };

            if core.retry.should_retry(&err, attempt) {
                let delay = core.retry.delay_for_attempt(attempt, Some(&err));
                warn!(
                    url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Request failed, retrying after delay"
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }

    async fn base_headers(core: &Arc<PipelineCore>, skip_auth: bool) -> Vec<(String, String)> {
        let mut headers = vec![("accept".to_string(), "application/json".to_string())];
        if !skip_auth {
            if let Some(token) = core.tokens.access_token().await {
                headers.push(("authorization".to_string(), format!("Bearer {token}")));
            }
        }
        headers
    }

    /// Normalizes an HTTP error response into the crate taxonomy.
    fn normalize_error(raw: &RawResponse) -> Error {
        let payload = raw.json();
        let message = payload
            .as_ref()
            .and_then(|value| {
                value
                    .get("message")
                    .or_else(|| value.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP {}", raw.status));

        match raw.status {
            401 | 403 => Error::authentication(message),
            429 => {
                let retry_after = payload
                    .as_ref()
                    .and_then(|value| value.get("retry_after").and_then(Value::as_u64))
                    .map(Duration::from_secs);
                Error::rate_limit(message, retry_after)
            }
            status => match payload {
                Some(payload) => Error::api_with_payload(status, message, payload),
                None => Error::api(status, message),
            },
        }
    }

    // ==================== Token refresh ====================

    /// Coordinated single-flight token refresh.
    ///
    /// Exactly one refresh network call is ever in flight: the first 401
    /// performs it, concurrent 401s poll-wait on the in-progress flag
    /// (capped at 5s) and observe its outcome through the token store.
    async fn refresh_session(core: &Arc<PipelineCore>) -> Result<()> {
        if core.refresh_in_progress.swap(true, Ordering::SeqCst) {
            let started = Instant::now();
            while core.refresh_in_progress.load(Ordering::SeqCst) {
                if started.elapsed() >= REFRESH_MAX_WAIT {
                    return Err(Error::session_expired(
                        "Timed out waiting for token refresh",
                    ));
                }
                sleep(REFRESH_POLL_INTERVAL).await;
            }
            return if core.tokens.access_token().await.is_some() {
                Ok(())
            } else {
                Err(Error::session_expired("Session refresh failed"))
            };
        }

        let result = Self::perform_refresh(core).await;
        core.refresh_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn perform_refresh(core: &Arc<PipelineCore>) -> Result<()> {
        let Some(refresh_token) = core.tokens.refresh_token().await else {
            Self::tear_down_session(core).await;
            return Err(Error::session_expired("No refresh token stored"));
        };

        let prepared = PreparedRequest {
            method: HttpMethod::Post,
            url: core.api.resolve("/auth/refresh"),
            query: Vec::new(),
            headers: vec![("accept".to_string(), "application/json".to_string())],
            body: RequestBody::Json(json!({ "refresh_token": refresh_token })),
            timeout: core.api.request_timeout,
        };

        match core.transport.execute(prepared).await {
            Ok(raw) if raw.is_success() => {
                let body = raw
                    .json()
                    .ok_or_else(|| Error::parse("Refresh response was not JSON"))?;
                let access = body
                    .get("access_token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::parse("Refresh response missing access_token"))?;
                let refresh = body
                    .get("refresh_token")
                    .and_then(Value::as_str)
                    .unwrap_or(&refresh_token);
                core.tokens.store_tokens(access, refresh).await?;
                info!("Session token refreshed");
                Ok(())
            }
            Ok(raw) => {
                warn!(status = raw.status, "Token refresh rejected, tearing down session");
                Self::tear_down_session(core).await;
                Err(Error::session_expired("Token refresh rejected"))
            }
            Err(err) => {
                warn!(error = %err, "Token refresh failed, tearing down session");
                Self::tear_down_session(core).await;
                Err(Error::session_expired("Token refresh failed"))
            }
        }
    }

    async fn tear_down_session(core: &Arc<PipelineCore>) {
        if let Err(err) = core.tokens.clear_session().await {
            warn!(error = %err, "Failed to clear stored credentials");
        }
        core.cache.clear();
    }
}
