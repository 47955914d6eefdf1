//! Presence subsystem.
//!
//! Built atop the connection manager: marks the local user online/offline
//! against the REST backend, joins the global-online and per-match
//! presence groups, keeps the server-side "online" timestamp fresh with
//! its own heartbeat, and routes typing status through the batching
//! manager instead of sending per keystroke.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, info, instrument, warn};

use crate::batching::{BatchingManager, SignalType};
use crate::channels::ChannelPriority;
use crate::connection::{
    ConnectionManager, ConnectionState, PRESENCE_GLOBAL, presence_chat_channel,
    presence_matches_channel,
};
use crate::error::Result;
use crate::http::RequestOptions;

/// Default interval for the presence heartbeat. Distinct from the
/// connection-level heartbeat: this one keeps the server's "last seen
/// online" timestamp fresh.
pub const DEFAULT_PRESENCE_HEARTBEAT: Duration = Duration::from_secs(30);

struct PresenceInner {
    connection: ConnectionManager,
    batching: BatchingManager,
    heartbeat_interval: Duration,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    joined_groups: std::sync::Mutex<HashSet<String>>,
}

/// Presence tracking for the local user. Cheap to clone; all clones
/// share state.
#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<PresenceInner>,
}

impl PresenceManager {
    /// Creates a presence manager over the given connection and batcher.
    pub fn new(connection: ConnectionManager, batching: BatchingManager) -> Self {
        Self::with_heartbeat_interval(connection, batching, DEFAULT_PRESENCE_HEARTBEAT)
    }

    /// Creates a presence manager with a custom heartbeat interval.
    pub fn with_heartbeat_interval(
        connection: ConnectionManager,
        batching: BatchingManager,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                connection,
                batching,
                heartbeat_interval,
                heartbeat_task: Mutex::new(None),
                joined_groups: std::sync::Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Called once the connection reaches `connected`: marks the user
    /// online, joins the global-online and per-match groups, and starts
    /// the presence heartbeat.
    #[instrument(name = "presence_online", skip(self))]
    pub async fn handle_connected(&self) -> Result<()> {
        let inner = &self.inner;

        inner
            .connection
            .pipeline()
            .post("/presence/online", None, RequestOptions::default())
            .await?;
        info!("Marked user online");

        self.join_group(PRESENCE_GLOBAL).await;
        if let Some(user_id) = inner.connection.pipeline().tokens().user_id().await {
            self.join_group(&presence_matches_channel(&user_id)).await;
        }

        self.start_heartbeat().await;
        Ok(())
    }

    /// Called before the transport is torn down (disconnect, app
    /// backgrounding, logout): marks the user offline and leaves every
    /// presence group first.
    #[instrument(name = "presence_offline", skip(self))]
    pub async fn handle_disconnecting(&self) -> Result<()> {
        let inner = &self.inner;
        self.stop_heartbeat().await;

        let groups: Vec<String> = {
            let mut joined = inner
                .joined_groups
                .lock()
                .expect("presence groups poisoned");
            joined.drain().collect()
        };
        for group in groups {
            if let Err(err) = inner.connection.unsubscribe_channel(&group).await {
                warn!(group = %group, error = %err, "Failed to leave presence group");
            }
        }

        if let Err(err) = inner
            .connection
            .pipeline()
            .post("/presence/offline", None, RequestOptions::default())
            .await
        {
            warn!(error = %err, "Failed to mark user offline");
        } else {
            info!("Marked user offline");
        }
        Ok(())
    }

    /// Joins the presence group of one chat.
    pub async fn join_chat_presence(&self, chat_id: &str) {
        self.join_group(&presence_chat_channel(chat_id)).await;
    }

    /// Leaves the presence group of one chat.
    pub async fn leave_chat_presence(&self, chat_id: &str) {
        let group = presence_chat_channel(chat_id);
        self.inner
            .joined_groups
            .lock()
            .expect("presence groups poisoned")
            .remove(&group);
        if let Err(err) = self.inner.connection.unsubscribe_channel(&group).await {
            warn!(group = %group, error = %err, "Failed to leave presence group");
        }
    }

    /// Propagates the local user's typing state through the batching
    /// manager (typing class) rather than per keystroke.
    pub async fn set_typing(&self, chat_id: &str, is_typing: bool) -> Result<u64> {
        let user_id = self.inner.connection.pipeline().tokens().user_id().await;
        self.inner
            .batching
            .add_to_batch(
                SignalType::Typing,
                json!({ "is_typing": is_typing }),
                Some(chat_id.to_string()),
                user_id,
                false,
            )
            .await
    }

    /// Groups currently joined.
    pub fn joined_groups(&self) -> Vec<String> {
        self.inner
            .joined_groups
            .lock()
            .expect("presence groups poisoned")
            .iter()
            .cloned()
            .collect()
    }

    async fn join_group(&self, group: &str) {
        if let Err(err) = self
            .inner
            .connection
            .subscribe_channel(group, None, ChannelPriority::Medium)
            .await
        {
            warn!(group = %group, error = %err, "Failed to join presence group");
            return;
        }
        self.inner
            .joined_groups
            .lock()
            .expect("presence groups poisoned")
            .insert(group.to_string());
        debug!(group = %group, "Joined presence group");
    }

    /// Arms the presence heartbeat, clearing any previous timer first.
    /// The loop stops itself as soon as the connection is no longer
    /// `connected`.
    async fn start_heartbeat(&self) {
        let mut guard = self.inner.heartbeat_task.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(inner.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if inner.connection.state() != ConnectionState::Connected {
                    debug!("Connection not connected; presence heartbeat stopping");
                    break;
                }
                if let Err(err) = inner
                    .batching
                    .add_to_batch(SignalType::Heartbeat, json!({}), None, None, false)
                    .await
                {
                    warn!(error = %err, "Presence heartbeat enqueue failed");
                }
            }
        }));
    }

    async fn stop_heartbeat(&self) {
        if let Some(task) = self.inner.heartbeat_task.lock().await.take() {
            task.abort();
        }
    }
}
