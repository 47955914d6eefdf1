//! Connection manager: transport lifecycle, reconnection, heartbeat,
//! quality estimation, typed event dispatch, and the outbound queue.
//!
//! State machine:
//!
//! ```text
//! disconnected --connect--> connecting --success--> connected
//! connected --drop--> reconnecting --retry exhausted--> failed
//! connected --explicit disconnect--> disconnected
//! ```
//!
//! `reconnecting` always owns exactly one pending retry timer; a manual
//! `force_reconnect` cancels it and restarts from `connecting`.

mod events;
mod outbound;
mod state;
mod transport;

pub use events::{EventDispatcher, EventKind, EventListener, ListenerId, RealtimeEvent};
pub use outbound::{OutboundKind, OutboundQueue, QueuedOutboundMessage};
pub use state::{ConnectionMetrics, ConnectionQuality, ConnectionState, MetricsSnapshot};
pub use transport::{
    ChannelAuth, PRESENCE_GLOBAL, PubSubConnection, PubSubTransport, WireEvent, WsTransport,
    chat_channel, pong_id, presence_chat_channel, presence_matches_channel, requires_auth,
    user_channel,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channels::{ChannelManager, ChannelPriority, ChannelRelease};
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::http::{RequestOptions, RequestPipeline, RequestPriority};
use crate::push::NotificationPresenter;
use crate::repo::NotificationCounterRepository;
use crate::retry::RetryPolicy;

/// Optional collaborators wired into the manager at construction.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Local relational cache adapter for notification counters.
    pub repository: Option<Arc<dyn NotificationCounterRepository>>,
    /// Push-notification presenter.
    pub presenter: Option<Arc<dyn NotificationPresenter>>,
}

/// A channel subscription requested before the connection was up,
/// replayed automatically once `connected` fires.
#[derive(Debug, Clone)]
struct PendingSubscription {
    name: String,
    chat_id: Option<String>,
    priority: ChannelPriority,
}

struct ConnectionInner {
    config: CoreConfig,
    transport: Arc<dyn PubSubTransport>,
    pipeline: RequestPipeline,
    channels: Arc<ChannelManager>,
    dispatcher: EventDispatcher,
    metrics: ConnectionMetrics,
    state: AtomicU8,
    conn: Mutex<Option<Arc<dyn PubSubConnection>>>,
    // Each established connection gets a new epoch; a read loop whose
    // epoch went stale must not trigger reconnection
    conn_epoch: AtomicU64,
    outbound: OutboundQueue,
    pending_subscriptions: std::sync::Mutex<Vec<PendingSubscription>>,
    pending_pings: DashMap<u64, Instant>,
    ping_seq: AtomicU64,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    explicit_disconnect: AtomicBool,
    retry: RetryPolicy,
    repository: Option<Arc<dyn NotificationCounterRepository>>,
    presenter: Option<Arc<dyn NotificationPresenter>>,
    sweep_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

/// The real-time connection manager. Cheap to clone; all clones share
/// state. Explicitly constructed and injected, never a global.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    /// Creates a manager over the given transport and request pipeline.
    pub fn new(
        config: CoreConfig,
        pipeline: RequestPipeline,
        transport: Arc<dyn PubSubTransport>,
        collaborators: Collaborators,
    ) -> Self {
        let outbound = OutboundQueue::new(
            config.realtime.outbound_queue_capacity,
            config.realtime.outbound_max_retries,
        );
        let retry = RetryPolicy::new(crate::retry::RetryConfig {
            max_retries: config.realtime.max_reconnect_attempts,
            ..crate::retry::RetryConfig::for_connection()
        });
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                transport,
                pipeline,
                channels: ChannelManager::new(),
                dispatcher: EventDispatcher::new(),
                metrics: ConnectionMetrics::new(),
                state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
                conn: Mutex::new(None),
                conn_epoch: AtomicU64::new(0),
                outbound,
                pending_subscriptions: std::sync::Mutex::new(Vec::new()),
                pending_pings: DashMap::new(),
                ping_seq: AtomicU64::new(0),
                heartbeat_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                read_task: Mutex::new(None),
                explicit_disconnect: AtomicBool::new(false),
                retry,
                repository: collaborators.repository,
                presenter: collaborators.presenter,
                sweep_cancel: std::sync::Mutex::new(None),
            }),
        }
    }

    // ==================== Lifecycle ====================

    /// Starts the manager: arms the channel idle sweep and connects.
    #[instrument(name = "conn_start", skip(self))]
    pub async fn start(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        Arc::clone(&self.inner.channels)
            .start_sweep(cancel.clone())
            .await;
        *self
            .inner
            .sweep_cancel
            .lock()
            .expect("sweep cancel poisoned") = Some(cancel);
        self.connect().await
    }

    /// Stops the manager: explicit disconnect plus sweep teardown.
    #[instrument(name = "conn_stop", skip(self))]
    pub async fn stop(&self) {
        if let Some(cancel) = self
            .inner
            .sweep_cancel
            .lock()
            .expect("sweep cancel poisoned")
            .take()
        {
            cancel.cancel();
        }
        self.inner.channels.stop_sweep().await;
        let _ = self.disconnect().await;
    }

    /// Establishes the connection.
    ///
    /// Idempotent while connecting or connected. A missing stored
    /// credential transitions straight to `Failed`.
    #[instrument(name = "conn_connect", skip(self))]
    pub async fn connect(&self) -> Result<()> {
        self.inner.explicit_disconnect.store(false, Ordering::Release);
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!("Already connected or connecting");
                return Ok(());
            }
            _ => {}
        }

        match Self::establish(&self.inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::transition(&self.inner, ConnectionState::Failed);
                Err(err)
            }
        }
    }

    /// Explicitly disconnects. No reconnect is scheduled.
    #[instrument(name = "conn_disconnect", skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.explicit_disconnect.store(true, Ordering::Release);

        Self::abort_task(&inner.reconnect_task).await;
        Self::abort_task(&inner.heartbeat_task).await;
        inner.pending_pings.clear();

        if let Some(conn) = inner.conn.lock().await.take() {
            let _ = conn.close().await;
        }

        inner.channels.clear();
        inner.metrics.record_disconnected();
        inner.metrics.set_quality(ConnectionQuality::Offline);
        inner
            .channels
            .update_connection_quality(ConnectionQuality::Offline)
            .await;
        Self::transition(inner, ConnectionState::Disconnected);
        Ok(())
    }

    /// Cancels any pending reconnect timer, resets the metrics, and
    /// restarts from `connecting`.
    #[instrument(name = "conn_force_reconnect", skip(self))]
    pub async fn force_reconnect(&self) -> Result<()> {
        let inner = &self.inner;
        info!("Forcing reconnect");

        Self::abort_task(&inner.reconnect_task).await;
        Self::abort_task(&inner.heartbeat_task).await;
        inner.metrics.reset();
        inner.explicit_disconnect.store(false, Ordering::Release);

        // Invalidate the old read loop before closing, so its termination
        // cannot race a second reconnect
        inner.conn_epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(conn) = inner.conn.lock().await.take() {
            let _ = conn.close().await;
        }

        match Self::establish(inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "Forced reconnect failed, falling back to scheduled retries");
                Self::schedule_reconnect(inner).await;
                Err(err)
            }
        }
    }

    // ==================== Accessors ====================

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Current connection quality.
    pub fn quality(&self) -> ConnectionQuality {
        self.inner.metrics.quality()
    }

    /// Snapshot of the connection metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The channel manager.
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.inner.channels
    }

    /// The request pipeline this manager authenticates through.
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.inner.pipeline
    }

    /// Number of outbound actions buffered for replay.
    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.len()
    }

    // ==================== Typed events ====================

    /// Registers an event listener. Listeners run synchronously, in
    /// registration order.
    pub fn on(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        self.inner.dispatcher.on(kind, listener)
    }

    /// Removes a listener.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.dispatcher.off(kind, id)
    }

    // ==================== Channel subscriptions ====================

    /// Subscribes to a chat channel. While not connected the request is
    /// queued and replayed automatically once `connected` fires; it is
    /// never lost.
    pub async fn subscribe_chat(&self, chat_id: &str, priority: ChannelPriority) -> Result<()> {
        let name = chat_channel(chat_id);
        self.subscribe_channel(&name, Some(chat_id.to_string()), priority)
            .await
    }

    /// Unsubscribes from a chat channel.
    pub async fn unsubscribe_chat(&self, chat_id: &str) -> Result<()> {
        self.inner.channels.unsubscribe(&chat_channel(chat_id)).await;
        Ok(())
    }

    /// Subscribes to an arbitrary channel under budget enforcement.
    ///
    /// A budget refusal is a logged no-op: callers observe it through
    /// `channels().get(name)` remaining `None`.
    pub async fn subscribe_channel(
        &self,
        name: &str,
        chat_id: Option<String>,
        priority: ChannelPriority,
    ) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            debug!(channel = %name, "Not connected; queueing subscription for replay");
            self.inner
                .pending_subscriptions
                .lock()
                .expect("pending subscriptions poisoned")
                .push(PendingSubscription {
                    name: name.to_string(),
                    chat_id,
                    priority,
                });
            return Ok(());
        }
        Self::do_subscribe(&self.inner, name, chat_id, priority).await
    }

    /// Unsubscribes from an arbitrary channel.
    pub async fn unsubscribe_channel(&self, name: &str) -> Result<()> {
        self.inner.channels.unsubscribe(name).await;
        self.inner
            .pending_subscriptions
            .lock()
            .expect("pending subscriptions poisoned")
            .retain(|pending| pending.name != name);
        Ok(())
    }

    // ==================== Outbound actions ====================

    /// Sends a chat message, buffering it for replay while disconnected.
    pub async fn send_message(&self, chat_id: &str, payload: Value) -> Result<()> {
        self.send_outbound(
            OutboundKind::Message,
            Some(chat_id.to_string()),
            "message.send",
            payload,
        )
        .await
    }

    /// Sends a read receipt, buffering it for replay while disconnected.
    pub async fn send_read_receipt(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.send_outbound(
            OutboundKind::Read,
            Some(chat_id.to_string()),
            "message.mark_read",
            json!({ "message_id": message_id }),
        )
        .await
    }

    /// Sends a typing indicator, buffering it for replay while
    /// disconnected.
    pub async fn send_typing(&self, chat_id: &str, is_typing: bool) -> Result<()> {
        self.send_outbound(
            OutboundKind::Typing,
            Some(chat_id.to_string()),
            "chat.typing",
            json!({ "is_typing": is_typing }),
        )
        .await
    }

    /// Publishes a raw client event, buffering it while disconnected.
    pub async fn send_event(
        &self,
        chat_id: Option<String>,
        event: &str,
        payload: Value,
    ) -> Result<()> {
        self.send_outbound(OutboundKind::Event, chat_id, event, payload)
            .await
    }

    async fn send_outbound(
        &self,
        kind: OutboundKind,
        chat_id: Option<String>,
        event: &str,
        payload: Value,
    ) -> Result<()> {
        let inner = &self.inner;

        if self.state() == ConnectionState::Connected {
            let conn = inner.conn.lock().await.clone();
            if let Some(conn) = conn {
                let channel = chat_id.as_deref().map(chat_channel);
                match conn.publish(event, channel.as_deref(), &payload).await {
                    Ok(()) => {
                        if let Some(channel) = &channel {
                            inner.channels.update_activity(channel);
                        }
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(event, error = %err, "Publish failed; buffering for replay");
                    }
                }
            }
        }

        inner.outbound.push(QueuedOutboundMessage::new(
            kind,
            chat_id,
            event,
            payload,
            kind == OutboundKind::Message,
        ));
        Ok(())
    }

    // ==================== Internals ====================

    fn transition(inner: &Arc<ConnectionInner>, new: ConnectionState) {
        let previous =
            ConnectionState::from_u8(inner.state.swap(new.as_u8(), Ordering::AcqRel));
        if previous == new {
            return;
        }
        info!(from = %previous, to = %new, "Connection state changed");
        inner.dispatcher.emit(&RealtimeEvent::new(
            EventKind::ConnectionStateChanged,
            json!({ "state": new.as_str(), "previous": previous.as_str() }),
        ));
    }

    async fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
        if let Some(task) = slot.lock().await.take() {
            task.abort();
        }
    }

    /// Full connection establishment: transport connect, state flip,
    /// heartbeat, global channel, pending-subscription replay, and
    /// outbound queue drain.
    async fn establish(inner: &Arc<ConnectionInner>) -> Result<()> {
        if !inner.pipeline.tokens().has_session().await {
            Self::transition(inner, ConnectionState::Failed);
            return Err(Error::authentication("No stored credential"));
        }

        Self::transition(inner, ConnectionState::Connecting);

        let conn = inner.transport.connect(&inner.config.realtime).await?;
        let epoch = inner.conn_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *inner.conn.lock().await = Some(Arc::clone(&conn));

        inner.metrics.record_connected();
        // Until the first latency sample arrives the connection is
        // assumed at least good
        if inner.metrics.quality() < ConnectionQuality::Good {
            inner.metrics.set_quality(ConnectionQuality::Good);
        }
        inner
            .channels
            .update_connection_quality(inner.metrics.quality())
            .await;

        Self::transition(inner, ConnectionState::Connected);

        Self::spawn_read_loop(inner, Arc::clone(&conn), epoch).await;
        Self::start_heartbeat(inner).await;

        if let Some(user_id) = inner.pipeline.tokens().user_id().await {
            let channel = user_channel(&user_id);
            if let Err(err) =
                Self::do_subscribe(inner, &channel, None, ChannelPriority::High).await
            {
                warn!(channel = %channel, error = %err, "Global channel subscribe failed");
            }
        }

        let pending: Vec<PendingSubscription> = {
            let mut queued = inner
                .pending_subscriptions
                .lock()
                .expect("pending subscriptions poisoned");
            queued.drain(..).collect()
        };
        for subscription in pending {
            if let Err(err) = Self::do_subscribe(
                inner,
                &subscription.name,
                subscription.chat_id.clone(),
                subscription.priority,
            )
            .await
            {
                warn!(channel = %subscription.name, error = %err, "Queued subscribe failed");
            }
        }

        Self::drain_outbound(inner).await;
        Ok(())
    }

    fn spawn_read_loop<'a>(
        inner: &'a Arc<ConnectionInner>,
        conn: Arc<dyn PubSubConnection>,
        epoch: u64,
    ) -> impl std::future::Future<Output = ()> + Send + 'a {
        async move {
            let mut guard = inner.read_task.lock().await;
            if let Some(previous) = guard.take() {
                previous.abort();
            }
            let inner = Arc::clone(inner);
            *guard = Some(tokio::spawn(async move {
                while let Some(event) = conn.next_event().await {
                    Self::handle_wire_event(&inner, event).await;
                }
                if inner.conn_epoch.load(Ordering::Acquire) != epoch {
                    debug!("Stale read loop ended");
                    return;
                }
                Self::handle_connection_lost(&inner).await;
            }));
        }
    }

    async fn handle_wire_event(inner: &Arc<ConnectionInner>, event: WireEvent) {
        if let Some(id) = pong_id(&event) {
            if let Some((_, sent_at)) = inner.pending_pings.remove(&id) {
                let latency_ms = sent_at.elapsed().as_millis() as i64;
                let quality = inner.metrics.record_latency(latency_ms);
                inner.channels.update_connection_quality(quality).await;
                debug!(ping_id = id, latency_ms, quality = quality.as_str(), "Pong");
            }
            return;
        }

        if let Some(channel) = &event.channel {
            inner.channels.update_activity(channel);
        }

        let Some(kind) = EventKind::from_wire(&event.event) else {
            debug!(event = %event.event, "Dropping unknown wire event");
            return;
        };

        Self::apply_side_effects(inner, kind, &event).await;

        inner.dispatcher.emit(&RealtimeEvent {
            kind,
            channel: event.channel,
            payload: event.payload,
        });
    }

    /// Opportunistic collaborator updates. Every failure here is logged
    /// and swallowed: the cache and the presenter must never break the
    /// real-time pipeline.
    async fn apply_side_effects(
        inner: &Arc<ConnectionInner>,
        kind: EventKind,
        event: &WireEvent,
    ) {
        let user_id = inner.pipeline.tokens().user_id().await;

        if let (Some(repository), Some(user_id)) = (&inner.repository, &user_id) {
            let outcome = match kind {
                EventKind::MessageNew => repository.increment_unread_messages(user_id).await,
                EventKind::LikeNew => repository.increment_new_likes(user_id).await,
                EventKind::UnreadCountChanged => {
                    let count = event
                        .payload
                        .get("count")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32;
                    repository.set_unread_messages(user_id, count).await
                }
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                warn!(error = %err, "Notification counter update failed");
            }
        }

        let Some(presenter) = &inner.presenter else {
            return;
        };
        let outcome = match kind {
            EventKind::MessageNew => {
                let chat_id = event
                    .payload
                    .get("chat_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let sender = event
                    .payload
                    .get("sender_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Someone");
                presenter
                    .show_message_notification(&event.payload, chat_id, sender)
                    .await
            }
            EventKind::MatchNew => {
                presenter
                    .show_notification("New match", "You have a new match!", &event.payload)
                    .await
            }
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            warn!(error = %err, "Notification presentation failed");
        }
    }

    async fn handle_connection_lost(inner: &Arc<ConnectionInner>) {
        if inner.explicit_disconnect.load(Ordering::Acquire) {
            return;
        }
        warn!("Connection lost");

        inner.metrics.record_disconnected();
        Self::abort_task(&inner.heartbeat_task).await;
        inner.pending_pings.clear();
        *inner.conn.lock().await = None;
        inner.channels.clear();
        inner.metrics.set_quality(ConnectionQuality::Offline);
        inner
            .channels
            .update_connection_quality(ConnectionQuality::Offline)
            .await;

        if !inner.pipeline.tokens().has_session().await {
            info!("No stored credential; not reconnecting");
            Self::transition(inner, ConnectionState::Failed);
            return;
        }

        Self::schedule_reconnect(inner).await;
    }

    /// Arms the single reconnect timer. Any previous timer is cancelled
    /// first, so repeated drops never leave two pending.
    async fn schedule_reconnect(inner: &Arc<ConnectionInner>) {
        let mut guard = inner.reconnect_task.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        Self::transition(inner, ConnectionState::Reconnecting);

        let inner = Arc::clone(inner);
        let task = tokio::spawn(async move {
            loop {
                let attempt = inner.metrics.increment_reconnect_attempts();
                if attempt > inner.retry.max_retries() {
                    error!(
                        attempts = attempt - 1,
                        "Reconnection attempts exhausted"
                    );
                    Self::transition(&inner, ConnectionState::Failed);
                    inner.dispatcher.emit(&RealtimeEvent::new(
                        EventKind::ConnectionError,
                        json!({
                            "message": "Reconnection attempts exhausted",
                            "can_retry": false,
                        }),
                    ));
                    break;
                }

                let delay = inner.retry.delay_for_attempt(attempt - 1, None);
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect attempt"
                );
                sleep(delay).await;

                if inner.explicit_disconnect.load(Ordering::Acquire) {
                    break;
                }

                match Self::establish(&inner).await {
                    Ok(()) => {
                        info!(attempt, "Reconnection successful");
                        break;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "Reconnect attempt failed");
                        if err.as_authentication().is_some()
                            || err.as_session_expired().is_some()
                        {
                            Self::transition(&inner, ConnectionState::Failed);
                            break;
                        }
                        Self::transition(&inner, ConnectionState::Reconnecting);
                    }
                }
            }
        });
        *guard = Some(task);
    }

    /// Arms the heartbeat. The previous timer is always cleared first, so
    /// reconnect cycles never stack heartbeats.
    async fn start_heartbeat(inner: &Arc<ConnectionInner>) {
        let mut guard = inner.heartbeat_task.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        let inner = Arc::clone(inner);
        *guard = Some(tokio::spawn(async move {
            let heartbeat_interval =
                Duration::from_millis(inner.config.realtime.heartbeat_interval);
            let pong_timeout = Duration::from_millis(inner.config.realtime.pong_timeout);
            let mut ticker = interval(heartbeat_interval);
            // The first tick fires immediately; the connection was just
            // verified, skip it
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if ConnectionState::from_u8(inner.state.load(Ordering::Acquire))
                    != ConnectionState::Connected
                {
                    break;
                }
                let conn = inner.conn.lock().await.clone();
                let Some(conn) = conn else { break };

                let id = inner.ping_seq.fetch_add(1, Ordering::AcqRel) + 1;
                inner.pending_pings.insert(id, Instant::now());
                if conn.ping(id).await.is_err() {
                    inner.pending_pings.remove(&id);
                    debug!("Heartbeat send failed; leaving drop detection to the transport");
                    continue;
                }

                sleep(pong_timeout).await;

                // Pong resolution removes the entry; if it is still here
                // the probe timed out. Quality degrades without dropping
                // the connection; the transport owns disconnect detection
                if inner.pending_pings.remove(&id).is_some() {
                    warn!(ping_id = id, "Heartbeat pong timeout, degrading quality");
                    inner.metrics.set_quality(ConnectionQuality::Poor);
                    inner
                        .channels
                        .update_connection_quality(ConnectionQuality::Poor)
                        .await;
                }
            }
        }));
    }

    async fn do_subscribe(
        inner: &Arc<ConnectionInner>,
        name: &str,
        chat_id: Option<String>,
        priority: ChannelPriority,
    ) -> Result<()> {
        let conn = inner.conn.lock().await.clone();
        let Some(conn) = conn else {
            return Err(Error::transport("No live connection"));
        };

        let release = Arc::new(WireChannelRelease {
            conn: Arc::clone(&conn),
            name: name.to_string(),
        });
        if !inner
            .channels
            .subscribe(name, release, chat_id, priority)
            .await
        {
            // Budget refusal: logged by the channel manager; deliberately
            // not an error
            return Ok(());
        }

        let auth = if requires_auth(name) {
            match Self::fetch_channel_auth(inner, conn.socket_id(), name).await {
                Ok(auth) => Some(auth),
                Err(err) => {
                    inner.channels.forget(name);
                    return Err(err);
                }
            }
        } else {
            None
        };

        if let Err(err) = conn.subscribe(name, auth.as_ref()).await {
            inner.channels.forget(name);
            return Err(err);
        }
        Ok(())
    }

    /// Obtains a signed authorization for a private/presence channel by
    /// POSTing `{socket_id, channel_name}` through the request pipeline.
    async fn fetch_channel_auth(
        inner: &Arc<ConnectionInner>,
        socket_id: &str,
        channel: &str,
    ) -> Result<ChannelAuth> {
        let response = inner
            .pipeline
            .post(
                &inner.config.realtime.auth_endpoint,
                Some(json!({ "socket_id": socket_id, "channel_name": channel })),
                RequestOptions {
                    priority: Some(RequestPriority::High),
                    ..Default::default()
                },
            )
            .await?;

        let auth = response
            .body
            .get("auth")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::parse("Channel auth response missing 'auth'"))?
            .to_string();
        let channel_data = response
            .body
            .get("channel_data")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ChannelAuth { auth, channel_data })
    }

    /// Replays the buffered outbound queue in FIFO order, each entry
    /// bounded by its own retry budget.
    async fn drain_outbound(inner: &Arc<ConnectionInner>) {
        let queued = inner.outbound.drain();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "Replaying buffered outbound actions");

        let mut remaining = queued.into_iter();
        for message in remaining.by_ref() {
            if ConnectionState::from_u8(inner.state.load(Ordering::Acquire))
                != ConnectionState::Connected
            {
                // Connection dropped mid-drain: put this entry back
                // untouched and stop
                inner.outbound.push(message);
                break;
            }
            let conn = inner.conn.lock().await.clone();
            let Some(conn) = conn else {
                inner.outbound.push(message);
                break;
            };

            let channel = message.chat_id.as_deref().map(chat_channel);
            match conn
                .publish(&message.event, channel.as_deref(), &message.payload)
                .await
            {
                Ok(()) => {
                    debug!(event = %message.event, "Replayed buffered action");
                }
                Err(err) => {
                    warn!(event = %message.event, error = %err, "Replay failed");
                    inner.outbound.requeue_failed(message);
                }
            }
        }
        for message in remaining {
            inner.outbound.push(message);
        }
    }
}

/// Release handle tying a tracked channel back to the wire.
struct WireChannelRelease {
    conn: Arc<dyn PubSubConnection>,
    name: String,
}

#[async_trait]
impl ChannelRelease for WireChannelRelease {
    async fn release(&self) -> Result<()> {
        self.conn.unsubscribe(&self.name).await
    }
}

