//! Mock collaborators for tests.
//!
//! Available in test builds and behind the `test-utils` feature so
//! downstream crates can exercise the core without a backend.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::batching::{BatchedSignal, SignalSink, SignalType};
use crate::config::RealtimeConfig;
use crate::connection::{ChannelAuth, PubSubConnection, PubSubTransport, WireEvent};
use crate::error::{Error, Result};
use crate::http::{HttpTransport, PreparedRequest, RawResponse};

// ==================== HTTP ====================

/// One recorded HTTP exchange.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Method name.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Headers as sent.
    pub headers: Vec<(String, String)>,
    /// JSON body, when the request had one.
    pub body: Option<Value>,
}

enum MockBehavior {
    Always(RawResponse),
    Scripted(StdMutex<std::collections::VecDeque<Result<RawResponse>>>),
}

/// Scriptable [`HttpTransport`] recording every call.
pub struct MockHttpTransport {
    behavior: MockBehavior,
    calls: StdMutex<Vec<RecordedCall>>,
    delay: StdMutex<Duration>,
}

impl MockHttpTransport {
    /// Responds to every call with the same status and JSON body.
    pub fn always(status: u16, body: Value) -> Arc<Self> {
        Arc::new(Self {
            behavior: MockBehavior::Always(RawResponse {
                status,
                body: body.to_string().into_bytes(),
            }),
            calls: StdMutex::new(Vec::new()),
            delay: StdMutex::new(Duration::ZERO),
        })
    }

    /// Responds with the given (status, body) sequence, in order. Calls
    /// past the end of the script fail the test loudly with a 599.
    pub fn scripted(responses: Vec<(u16, Value)>) -> Arc<Self> {
        let queue = responses
            .into_iter()
            .map(|(status, body)| {
                Ok(RawResponse {
                    status,
                    body: body.to_string().into_bytes(),
                })
            })
            .collect();
        Arc::new(Self {
            behavior: MockBehavior::Scripted(StdMutex::new(queue)),
            calls: StdMutex::new(Vec::new()),
            delay: StdMutex::new(Duration::ZERO),
        })
    }

    /// Responds with the given outcome sequence, allowing scripted
    /// network failures.
    pub fn scripted_outcomes(outcomes: Vec<Result<RawResponse>>) -> Arc<Self> {
        Arc::new(Self {
            behavior: MockBehavior::Scripted(StdMutex::new(outcomes.into_iter().collect())),
            calls: StdMutex::new(Vec::new()),
            delay: StdMutex::new(Duration::ZERO),
        })
    }

    /// Adds an artificial await before each response, so concurrent
    /// callers genuinely overlap.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Number of calls executed so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse> {
        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let body = match &request.body {
            crate::http::RequestBody::Json(value) => Some(value.clone()),
            _ => None,
        };
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method.as_str().to_string(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body,
        });

        match &self.behavior {
            MockBehavior::Always(response) => Ok(response.clone()),
            MockBehavior::Scripted(queue) => {
                queue.lock().unwrap().pop_front().unwrap_or(Ok(RawResponse {
                    status: 599,
                    body: b"mock script exhausted".to_vec(),
                }))
            }
        }
    }
}

// ==================== Pub/sub ====================

/// Drivable [`PubSubTransport`]: hands out [`MockPubSubConnection`]s and
/// can be told to fail upcoming connects.
pub struct MockPubSubTransport {
    connections: StdMutex<Vec<Arc<MockPubSubConnection>>>,
    fail_connects: AtomicUsize,
    connect_count: AtomicUsize,
}

impl MockPubSubTransport {
    /// Creates the transport.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: StdMutex::new(Vec::new()),
            fail_connects: AtomicUsize::new(0),
            connect_count: AtomicUsize::new(0),
        })
    }

    /// Makes the next `n` connect attempts fail with a network error.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of connect attempts observed.
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// The most recently handed out connection.
    pub fn last_connection(&self) -> Option<Arc<MockPubSubConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PubSubTransport for MockPubSubTransport {
    async fn connect(&self, _config: &RealtimeConfig) -> Result<Arc<dyn PubSubConnection>> {
        let attempt = self.connect_count.fetch_add(1, Ordering::SeqCst) + 1;

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::network("simulated connect failure"));
        }

        let connection = MockPubSubConnection::new(format!("socket-{attempt}"));
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Drivable pub/sub connection: tests inject inbound events and inspect
/// outbound traffic.
pub struct MockPubSubConnection {
    socket_id: String,
    open: AtomicBool,
    auto_pong: AtomicBool,
    fail_publish: AtomicBool,
    subscribed: StdMutex<Vec<(String, bool)>>,
    unsubscribed: StdMutex<Vec<String>>,
    published: StdMutex<Vec<(String, Option<String>, Value)>>,
    pings: StdMutex<Vec<u64>>,
    event_tx: StdMutex<Option<mpsc::UnboundedSender<WireEvent>>>,
    event_rx: Mutex<mpsc::UnboundedReceiver<WireEvent>>,
}

impl MockPubSubConnection {
    /// Creates a connection with the given socket id.
    pub fn new(socket_id: impl Into<String>) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            socket_id: socket_id.into(),
            open: AtomicBool::new(true),
            auto_pong: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            subscribed: StdMutex::new(Vec::new()),
            unsubscribed: StdMutex::new(Vec::new()),
            published: StdMutex::new(Vec::new()),
            pings: StdMutex::new(Vec::new()),
            event_tx: StdMutex::new(Some(event_tx)),
            event_rx: Mutex::new(event_rx),
        })
    }

    /// Injects an inbound wire event.
    pub fn push_event(&self, event: &str, channel: Option<&str>, payload: Value) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(WireEvent {
                event: event.to_string(),
                channel: channel.map(str::to_string),
                payload,
            });
        }
    }

    /// Simulates the server dropping the connection: the event stream
    /// ends and `next_event` returns `None`.
    pub fn drop_from_server(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.event_tx.lock().unwrap().take();
    }

    /// Whether pings are answered with pongs automatically (default on).
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Makes publish calls fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Channels subscribed, with whether an auth payload was attached.
    pub fn subscriptions(&self) -> Vec<(String, bool)> {
        self.subscribed.lock().unwrap().clone()
    }

    /// Channels unsubscribed.
    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    /// Published client events as (event, channel, payload).
    pub fn published(&self) -> Vec<(String, Option<String>, Value)> {
        self.published.lock().unwrap().clone()
    }

    /// Ping correlation ids observed.
    pub fn pings(&self) -> Vec<u64> {
        self.pings.lock().unwrap().clone()
    }
}

#[async_trait]
impl PubSubConnection for MockPubSubConnection {
    fn socket_id(&self) -> &str {
        &self.socket_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, channel: &str, auth: Option<&ChannelAuth>) -> Result<()> {
        self.subscribed
            .lock()
            .unwrap()
            .push((channel.to_string(), auth.is_some()));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.unsubscribed.lock().unwrap().push(channel.to_string());
        Ok(())
    }

    async fn publish(&self, event: &str, channel: Option<&str>, payload: &Value) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::transport("simulated publish failure"));
        }
        self.published.lock().unwrap().push((
            event.to_string(),
            channel.map(str::to_string),
            payload.clone(),
        ));
        Ok(())
    }

    async fn ping(&self, id: u64) -> Result<()> {
        self.pings.lock().unwrap().push(id);
        if self.auto_pong.load(Ordering::SeqCst) {
            self.push_event("pong", None, serde_json::json!({ "id": id }));
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<WireEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.event_tx.lock().unwrap().take();
        Ok(())
    }
}

// ==================== Batching ====================

/// [`SignalSink`] capturing every delivered batch.
pub struct CaptureSink {
    delivered: StdMutex<Vec<(SignalType, Vec<BatchedSignal>)>>,
}

impl CaptureSink {
    /// Creates the sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: StdMutex::new(Vec::new()),
        })
    }

    /// Every delivered batch, in order.
    pub fn batches(&self) -> Vec<(SignalType, Vec<BatchedSignal>)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalSink for CaptureSink {
    async fn deliver(&self, signal: SignalType, batch: Vec<BatchedSignal>) -> Result<()> {
        self.delivered.lock().unwrap().push((signal, batch));
        Ok(())
    }
}
