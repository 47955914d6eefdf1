//! Batching of high-frequency, low-value signals.
//!
//! Presence pings, typing indicators, read receipts, and heartbeats are
//! coalesced into periodic batches instead of hitting the wire per
//! keystroke. Same-key signals within a window replace each other (latest
//! typing state wins); read receipts key on message id so distinct
//! receipts coexist.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// Signal classes with independent flush cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Presence pings.
    Presence,
    /// Read receipts.
    ReadReceipt,
    /// Typing indicators.
    Typing,
    /// Application-level heartbeats.
    Heartbeat,
}

impl SignalType {
    /// All signal classes.
    pub const ALL: [SignalType; 4] = [
        Self::Presence,
        Self::ReadReceipt,
        Self::Typing,
        Self::Heartbeat,
    ];

    /// Lower-case name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::ReadReceipt => "read_receipt",
            Self::Typing => "typing",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// One coalesced signal.
#[derive(Debug, Clone)]
pub struct BatchedSignal {
    /// Assigned id, returned from [`BatchingManager::add_to_batch`].
    pub id: u64,
    /// Signal class.
    pub signal: SignalType,
    /// Payload.
    pub payload: Value,
    /// Chat scope, when chat-scoped.
    pub chat_id: Option<String>,
    /// User scope, when user-scoped.
    pub user_id: Option<String>,
    /// Enqueue timestamp (ms since epoch).
    pub queued_at: i64,
}

impl BatchedSignal {
    /// Coalescing key: `(type, chat)` or `(type, user)` or `(type,
    /// global)`, except read receipts, which key on message id so
    /// multiple distinct receipts within a window coexist.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        if self.signal == SignalType::ReadReceipt {
            let message_id = self
                .payload
                .get("message_id")
                .and_then(Value::as_str)
                .unwrap_or("?");
            return format!(
                "read:{}:{message_id}",
                self.chat_id.as_deref().unwrap_or("global")
            );
        }
        let scope = self
            .chat_id
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("global");
        format!("{}:{scope}", self.signal.as_str())
    }
}

/// Batching configuration.
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    /// Globally disables batching: every signal is sent synchronously.
    pub enabled: bool,
    /// A batch reaching this size flushes immediately.
    pub max_batch_size: usize,
    /// Presence flush interval.
    pub presence_interval: Duration,
    /// Read-receipt flush interval.
    pub read_receipt_interval: Duration,
    /// Typing flush interval.
    pub typing_interval: Duration,
    /// Heartbeat flush interval.
    pub heartbeat_interval: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 50,
            presence_interval: Duration::from_secs(5),
            read_receipt_interval: Duration::from_secs(2),
            typing_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl BatchingConfig {
    fn interval_for(&self, signal: SignalType) -> Duration {
        match signal {
            SignalType::Presence => self.presence_interval,
            SignalType::ReadReceipt => self.read_receipt_interval,
            SignalType::Typing => self.typing_interval,
            SignalType::Heartbeat => self.heartbeat_interval,
        }
    }
}

/// Type-specific delivery of flushed batches.
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Delivers one flushed batch. The batch is never empty.
    async fn deliver(&self, signal: SignalType, batch: Vec<BatchedSignal>) -> Result<()>;
}

struct BatchingInner {
    sink: Arc<dyn SignalSink>,
    config: std::sync::Mutex<BatchingConfig>,
    enabled: AtomicBool,
    pending: Mutex<HashMap<SignalType, Vec<BatchedSignal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
    next_id: AtomicU64,
    batches_flushed: AtomicU64,
    signals_seen: AtomicU64,
    signals_coalesced: AtomicU64,
    // Rough trend indicator, not a true mean over time
    avg_batch_size: std::sync::Mutex<f64>,
}

/// Coalesces high-frequency signals into periodic batches. Cheap to
/// clone; all clones share state.
#[derive(Clone)]
pub struct BatchingManager {
    inner: Arc<BatchingInner>,
}

impl BatchingManager {
    /// Creates a manager delivering through the given sink.
    pub fn new(sink: Arc<dyn SignalSink>, config: BatchingConfig) -> Self {
        let enabled = config.enabled;
        Self {
            inner: Arc::new(BatchingInner {
                sink,
                config: std::sync::Mutex::new(config),
                enabled: AtomicBool::new(enabled),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                cancel: std::sync::Mutex::new(None),
                next_id: AtomicU64::new(0),
                batches_flushed: AtomicU64::new(0),
                signals_seen: AtomicU64::new(0),
                signals_coalesced: AtomicU64::new(0),
                avg_batch_size: std::sync::Mutex::new(0.0),
            }),
        }
    }

    /// Replaces the configuration. Flush timers pick the new intervals up
    /// on the next [`start`].
    ///
    /// [`start`]: BatchingManager::start
    pub fn configure(&self, config: BatchingConfig) {
        self.inner
            .enabled
            .store(config.enabled, Ordering::Release);
        *self.inner.config.lock().expect("batching config poisoned") = config;
    }

    /// Starts the per-type flush timers. A previous set is torn down
    /// first.
    pub async fn start(&self) {
        self.stop().await;

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().expect("batching cancel poisoned") = Some(cancel.clone());

        let intervals: Vec<(SignalType, Duration)> = {
            let config = self.inner.config.lock().expect("batching config poisoned");
            SignalType::ALL
                .iter()
                .map(|&signal| (signal, config.interval_for(signal)))
                .collect()
        };

        let mut tasks = self.inner.tasks.lock().await;
        for (signal, period) in intervals {
            let manager = self.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => manager.flush_type(signal).await,
                    }
                }
            }));
        }
    }

    /// Stops the flush timers, flushing everything still pending.
    pub async fn stop(&self) {
        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .expect("batching cancel poisoned")
            .take()
        {
            cancel.cancel();
        }
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        self.flush_all().await;
    }

    /// Adds a signal, returning its id.
    ///
    /// `immediate` (or globally disabled batching) bypasses the queue and
    /// delivers synchronously. Otherwise the signal coalesces with an
    /// existing same-key entry, and a batch hitting the size cap flushes
    /// without waiting for its timer.
    pub async fn add_to_batch(
        &self,
        signal: SignalType,
        payload: Value,
        chat_id: Option<String>,
        user_id: Option<String>,
        immediate: bool,
    ) -> Result<u64> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        inner.signals_seen.fetch_add(1, Ordering::Relaxed);

        let entry = BatchedSignal {
            id,
            signal,
            payload,
            chat_id,
            user_id,
            queued_at: chrono::Utc::now().timestamp_millis(),
        };

        if immediate || !inner.enabled.load(Ordering::Acquire) {
            inner.sink.deliver(signal, vec![entry]).await?;
            return Ok(id);
        }

        let flush_now = {
            let mut pending = inner.pending.lock().await;
            let batch = pending.entry(signal).or_default();
            let key = entry.dedup_key();
            if let Some(existing) = batch.iter_mut().find(|queued| queued.dedup_key() == key) {
                // Latest state wins; the older entry is dropped
                *existing = entry;
                inner.signals_coalesced.fetch_add(1, Ordering::Relaxed);
            } else {
                batch.push(entry);
            }

            let max = inner
                .config
                .lock()
                .expect("batching config poisoned")
                .max_batch_size;
            batch.len() >= max
        };

        if flush_now {
            debug!(signal = signal.as_str(), "Batch reached size cap, flushing early");
            self.flush_type(signal).await;
        }
        Ok(id)
    }

    /// Flushes one signal class now.
    pub async fn flush_type(&self, signal: SignalType) {
        let batch = {
            let mut pending = self.inner.pending.lock().await;
            match pending.remove(&signal) {
                Some(batch) if !batch.is_empty() => batch,
                _ => return,
            }
        };

        let size = batch.len();
        let batch = Self::reduce(signal, batch);

        if let Err(err) = self.inner.sink.deliver(signal, batch).await {
            warn!(signal = signal.as_str(), error = %err, "Batch delivery failed");
        }

        self.inner.batches_flushed.fetch_add(1, Ordering::Relaxed);
        let mut avg = self
            .inner
            .avg_batch_size
            .lock()
            .expect("batch stats poisoned");
        *avg = if *avg == 0.0 {
            size as f64
        } else {
            (*avg + size as f64) / 2.0
        };
    }

    /// Flushes every pending batch.
    pub async fn flush_all(&self) {
        for signal in SignalType::ALL {
            self.flush_type(signal).await;
        }
    }

    /// Final per-flush grouping: typing keeps only the most recent state
    /// per (user, chat); presence keeps one update per user. Dedup keys
    /// already guarantee this for queued entries; the reduction also
    /// holds for batches assembled elsewhere.
    fn reduce(signal: SignalType, batch: Vec<BatchedSignal>) -> Vec<BatchedSignal> {
        match signal {
            SignalType::Typing | SignalType::Presence => {
                let mut latest: HashMap<String, BatchedSignal> = HashMap::new();
                for entry in batch {
                    latest.insert(entry.dedup_key(), entry);
                }
                let mut reduced: Vec<BatchedSignal> = latest.into_values().collect();
                reduced.sort_by_key(|entry| entry.id);
                reduced
            }
            _ => batch,
        }
    }

    /// Number of signals currently pending for a class.
    pub async fn pending_len(&self, signal: SignalType) -> usize {
        self.inner
            .pending
            .lock()
            .await
            .get(&signal)
            .map_or(0, Vec::len)
    }

    /// Batching statistics.
    pub fn stats(&self) -> BatchingStats {
        BatchingStats {
            signals_seen: self.inner.signals_seen.load(Ordering::Relaxed),
            signals_coalesced: self.inner.signals_coalesced.load(Ordering::Relaxed),
            batches_flushed: self.inner.batches_flushed.load(Ordering::Relaxed),
            avg_batch_size: *self
                .inner
                .avg_batch_size
                .lock()
                .expect("batch stats poisoned"),
        }
    }
}

/// Production sink: routes each flushed group to its type-specific
/// sender. Typing and read receipts go out over the live connection;
/// presence and heartbeats go to the REST backend.
pub struct RealtimeSignalSink {
    connection: crate::connection::ConnectionManager,
}

impl RealtimeSignalSink {
    /// Creates the sink over the given connection manager.
    pub fn new(connection: crate::connection::ConnectionManager) -> Arc<Self> {
        Arc::new(Self { connection })
    }
}

#[async_trait]
impl SignalSink for RealtimeSignalSink {
    async fn deliver(&self, signal: SignalType, batch: Vec<BatchedSignal>) -> Result<()> {
        use crate::http::RequestOptions;
        use serde_json::json;

        match signal {
            SignalType::Typing => {
                for entry in batch {
                    if let Some(chat_id) = &entry.chat_id {
                        self.connection
                            .send_event(Some(chat_id.clone()), "chat.typing", entry.payload)
                            .await?;
                    }
                }
            }
            SignalType::ReadReceipt => {
                for entry in batch {
                    self.connection
                        .send_event(entry.chat_id.clone(), "message.mark_read", entry.payload)
                        .await?;
                }
            }
            SignalType::Presence => {
                let updates: Vec<serde_json::Value> = batch
                    .into_iter()
                    .map(|entry| {
                        json!({
                            "user_id": entry.user_id,
                            "payload": entry.payload,
                            "at": entry.queued_at,
                        })
                    })
                    .collect();
                self.connection
                    .pipeline()
                    .post(
                        "/presence/update",
                        Some(json!({ "updates": updates })),
                        RequestOptions::default(),
                    )
                    .await?;
            }
            SignalType::Heartbeat => {
                self.connection
                    .pipeline()
                    .post("/presence/heartbeat", None, RequestOptions::default())
                    .await?;
            }
        }
        Ok(())
    }
}

/// Snapshot of batching statistics.
#[derive(Debug, Clone)]
pub struct BatchingStats {
    /// Signals accepted (queued or immediate).
    pub signals_seen: u64,
    /// Signals that replaced an older same-key entry.
    pub signals_coalesced: u64,
    /// Batches delivered.
    pub batches_flushed: u64,
    /// Rough average flushed-batch size (trend indicator only).
    pub avg_batch_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct CaptureSink {
        delivered: StdMutex<Vec<(SignalType, Vec<BatchedSignal>)>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: StdMutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<(SignalType, Vec<BatchedSignal>)> {
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

    fn manager_with(sink: Arc<CaptureSink>) -> BatchingManager {
        BatchingManager::new(sink, BatchingConfig::default())
    }

    #[tokio::test]
    async fn test_typing_same_key_coalesces_to_latest() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));

        for state in [true, false, true] {
            manager
                .add_to_batch(
                    SignalType::Typing,
                    json!({ "is_typing": state }),
                    Some("chat-1".into()),
                    Some("user-1".into()),
                    false,
                )
                .await
                .unwrap();
        }

        manager.flush_type(SignalType::Typing).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let (signal, batch) = &batches[0];
        assert_eq!(*signal, SignalType::Typing);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload["is_typing"], true);
        assert_eq!(manager.stats().signals_coalesced, 2);
    }

    #[tokio::test]
    async fn test_read_receipts_keep_distinct_message_ids() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));

        for message_id in ["m1", "m2", "m1"] {
            manager
                .add_to_batch(
                    SignalType::ReadReceipt,
                    json!({ "message_id": message_id }),
                    Some("chat-1".into()),
                    None,
                    false,
                )
                .await
                .unwrap();
        }

        manager.flush_type(SignalType::ReadReceipt).await;
        let batches = sink.batches();
        assert_eq!(batches[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_immediate_bypasses_queue() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));

        manager
            .add_to_batch(SignalType::Presence, json!({}), None, Some("u1".into()), true)
            .await
            .unwrap();

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(manager.pending_len(SignalType::Presence).await, 0);
    }

    #[tokio::test]
    async fn test_disabled_batching_sends_synchronously() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));
        manager.configure(BatchingConfig {
            enabled: false,
            ..Default::default()
        });

        manager
            .add_to_batch(SignalType::Typing, json!({}), Some("c1".into()), None, false)
            .await
            .unwrap();
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_size_cap_forces_flush() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));
        manager.configure(BatchingConfig {
            max_batch_size: 3,
            ..Default::default()
        });

        for i in 0..3 {
            manager
                .add_to_batch(
                    SignalType::ReadReceipt,
                    json!({ "message_id": format!("m{i}") }),
                    Some("chat-1".into()),
                    None,
                    false,
                )
                .await
                .unwrap();
        }

        // Flushed by the size cap, not a timer
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 3);
        assert_eq!(manager.pending_len(SignalType::ReadReceipt).await, 0);
    }

    #[tokio::test]
    async fn test_flush_all_covers_every_type() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));

        manager
            .add_to_batch(SignalType::Typing, json!({}), Some("c1".into()), None, false)
            .await
            .unwrap();
        manager
            .add_to_batch(SignalType::Presence, json!({}), None, Some("u1".into()), false)
            .await
            .unwrap();

        manager.flush_all().await;
        assert_eq!(sink.batches().len(), 2);
        assert!(manager.stats().avg_batch_size > 0.0);
    }

    #[tokio::test]
    async fn test_timer_flushes_batch() {
        let sink = CaptureSink::new();
        let manager = manager_with(Arc::clone(&sink));
        manager.configure(BatchingConfig {
            typing_interval: Duration::from_millis(20),
            ..Default::default()
        });
        manager.start().await;

        manager
            .add_to_batch(SignalType::Typing, json!({}), Some("c1".into()), None, false)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!sink.batches().is_empty());
        manager.stop().await;
    }
}
