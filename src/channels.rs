//! Logical channel management with a quality-adaptive budget.
//!
//! The manager tracks every subscribed channel, enforces a connection-
//! quality-derived cap on how many stay open, evicts the worst candidates
//! when the budget is exceeded, and sweeps idle channels on a timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionQuality;
use crate::error::Result;

/// Default idle timeout before the sweep removes an inactive channel.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
/// How often the idle sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Releases the server-side subscription behind a tracked channel.
///
/// `release` failing must never leak bookkeeping: the manager removes its
/// entry regardless of the outcome.
#[async_trait]
pub trait ChannelRelease: Send + Sync {
    /// Tears down the underlying subscription.
    async fn release(&self) -> Result<()>;
}

/// Priority tier of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelPriority {
    /// Evicted first.
    Low,
    /// The default tier.
    Medium,
    /// Protected from eviction unless the incoming channel is also high.
    High,
}

impl ChannelPriority {
    /// Contribution to the removal score; lower priority scores higher.
    fn eviction_weight(self) -> i64 {
        match self {
            Self::Low => 200,
            Self::Medium => 100,
            Self::High => 0,
        }
    }

    /// Lower-case name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Bookkeeping for one subscribed channel.
pub struct ChannelInfo {
    /// Channel name.
    pub name: String,
    /// Associated chat, when chat-scoped.
    pub chat_id: Option<String>,
    /// Priority tier.
    pub priority: ChannelPriority,
    handle: Arc<dyn ChannelRelease>,
    last_activity: AtomicI64,
    active: AtomicBool,
}

impl ChannelInfo {
    /// Timestamp of the last inbound/outbound activity (ms since epoch).
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Whether the channel is currently marked active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ChannelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelInfo")
            .field("name", &self.name)
            .field("chat_id", &self.chat_id)
            .field("priority", &self.priority)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Channel bookkeeping with budget enforcement and idle sweeping.
pub struct ChannelManager {
    channels: DashMap<String, Arc<ChannelInfo>>,
    quality: AtomicU8,
    idle_timeout: Duration,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    /// Creates a manager with the default idle timeout.
    pub fn new() -> Arc<Self> {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    /// Creates a manager with a custom idle timeout.
    pub fn with_idle_timeout(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            quality: AtomicU8::new(ConnectionQuality::Offline.as_u8()),
            idle_timeout,
            sweep_task: Mutex::new(None),
        })
    }

    /// Current quality the budget derives from.
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_u8(self.quality.load(Ordering::Acquire))
    }

    /// Current channel budget.
    pub fn budget(&self) -> usize {
        self.quality().channel_budget()
    }

    /// Number of tracked channels.
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Registers a subscription under budget enforcement.
    ///
    /// Returns `false` when admission failed: the budget is zero (offline)
    /// or eviction could not free a slot. A refused subscribe is a logged
    /// no-op, not an error; callers observe the refusal through [`get`].
    ///
    /// [`get`]: ChannelManager::get
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        handle: Arc<dyn ChannelRelease>,
        chat_id: Option<String>,
        priority: ChannelPriority,
    ) -> bool {
        let name = name.into();
        let budget = self.budget();

        if budget == 0 {
            warn!(channel = %name, "Subscribe refused: connection offline");
            return false;
        }

        // Resubscribing an existing channel refreshes its bookkeeping
        // without consuming budget
        if let Some(existing) = self.channels.get(&name) {
            existing.touch();
            return true;
        }

        if self.channels.len() >= budget
            && !self.evict_for(budget.saturating_sub(1), priority).await
        {
            warn!(
                channel = %name,
                priority = priority.as_str(),
                budget,
                "Subscribe refused: budget reached and no evictable channel"
            );
            return false;
        }

        let info = Arc::new(ChannelInfo {
            name: name.clone(),
            chat_id,
            priority,
            handle,
            last_activity: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            active: AtomicBool::new(true),
        });
        self.channels.insert(name.clone(), info);
        debug!(channel = %name, priority = priority.as_str(), "Channel subscribed");
        true
    }

    /// Unsubscribes a channel. The release handle failing still removes
    /// the bookkeeping entry; a tracked-but-dead channel must never leak.
    ///
    /// Returns whether the channel was tracked.
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let Some((_, info)) = self.channels.remove(name) else {
            return false;
        };
        if let Err(err) = info.handle.release().await {
            warn!(channel = %name, error = %err, "Channel release failed; entry removed anyway");
        } else {
            debug!(channel = %name, "Channel unsubscribed");
        }
        true
    }

    /// Looks up a tracked channel.
    pub fn get(&self, name: &str) -> Option<Arc<ChannelInfo>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Records activity on a channel.
    pub fn update_activity(&self, name: &str) {
        if let Some(info) = self.channels.get(name) {
            info.touch();
        }
    }

    /// Marks a channel inactive, making it a sweep candidate.
    pub fn mark_inactive(&self, name: &str) {
        if let Some(info) = self.channels.get(name) {
            info.active.store(false, Ordering::Relaxed);
        }
    }

    /// Applies a new quality level. A downgrade that leaves the manager
    /// over the new budget triggers immediate eviction; compliance does
    /// not wait for the next subscribe.
    pub async fn update_connection_quality(&self, quality: ConnectionQuality) {
        let previous =
            ConnectionQuality::from_u8(self.quality.swap(quality.as_u8(), Ordering::AcqRel));
        if previous == quality {
            return;
        }
        info!(
            from = previous.as_str(),
            to = quality.as_str(),
            budget = quality.channel_budget(),
            "Connection quality changed"
        );

        let budget = quality.channel_budget();
        if self.channels.len() > budget {
            self.evict_for(budget, ChannelPriority::High).await;
        }
    }

    /// Removes one entry without releasing its handle. Used to roll back
    /// admission when the wire subscribe itself failed.
    pub fn forget(&self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    /// Drops all bookkeeping without releasing handles. Used when the
    /// connection is lost: the server side is gone with the socket, so
    /// only client-side state needs resetting.
    pub fn clear(&self) {
        let dropped = self.channels.len();
        if dropped > 0 {
            debug!(dropped, "Clearing channel bookkeeping");
        }
        self.channels.clear();
    }

    /// Removal score for eviction ordering: low priority, inactivity, and
    /// age since last activity all raise it.
    fn removal_score(info: &ChannelInfo, now_ms: i64) -> i64 {
        let mut score = info.priority.eviction_weight();
        if !info.is_active() {
            score += 150;
        }
        score += (now_ms - info.last_activity()).max(0) / 60_000;
        score
    }

    /// Evicts channels until at most `target` remain.
    ///
    /// High-priority channels are only considered when the incoming
    /// channel is itself high-priority. Returns whether the target was
    /// reached.
    async fn evict_for(&self, target: usize, incoming: ChannelPriority) -> bool {
        loop {
            if self.channels.len() <= target {
                return true;
            }

            let now_ms = chrono::Utc::now().timestamp_millis();
            let victim = self
                .channels
                .iter()
                .filter(|entry| {
                    incoming == ChannelPriority::High
                        || entry.value().priority != ChannelPriority::High
                })
                .max_by_key(|entry| Self::removal_score(entry.value(), now_ms))
                .map(|entry| entry.key().clone());

            let Some(name) = victim else {
                return false;
            };

            if let Some((_, info)) = self.channels.remove(&name) {
                info!(
                    channel = %name,
                    priority = info.priority.as_str(),
                    active = info.is_active(),
                    "Evicting channel to honor budget"
                );
                if let Err(err) = info.handle.release().await {
                    warn!(channel = %name, error = %err, "Evicted channel release failed");
                }
            }
        }
    }

    /// Starts the periodic idle sweep. A previous sweep task is aborted
    /// first, so at most one runs.
    pub async fn start_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut task = self.sweep_task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let manager = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.sweep_idle().await,
                }
            }
        }));
    }

    /// Stops the idle sweep task.
    pub async fn stop_sweep(&self) {
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
    }

    /// Removes channels that have sat inactive past the idle timeout.
    /// High-priority channels get twice the grace period.
    pub async fn sweep_idle(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let base_timeout_ms = self.idle_timeout.as_millis() as i64;

        let expired: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| {
                let info = entry.value();
                if info.is_active() {
                    return false;
                }
                let timeout_ms = if info.priority == ChannelPriority::High {
                    base_timeout_ms * 2
                } else {
                    base_timeout_ms
                };
                now_ms - info.last_activity() > timeout_ms
            })
            .map(|entry| entry.key().clone())
            .collect();

        for name in expired {
            if let Some((_, info)) = self.channels.remove(&name) {
                info!(channel = %name, "Sweeping idle channel");
                if let Err(err) = info.handle.release().await {
                    warn!(channel = %name, error = %err, "Idle channel release failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRelease {
        released: AtomicUsize,
        fail: bool,
    }

    impl CountingRelease {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                released: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ChannelRelease for CountingRelease {
        async fn release(&self) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::Error::transport("release failed"))
            } else {
                Ok(())
            }
        }
    }

    async fn online_manager() -> Arc<ChannelManager> {
        let manager = ChannelManager::new();
        manager
            .update_connection_quality(ConnectionQuality::Excellent)
            .await;
        manager
    }

    #[tokio::test]
    async fn test_offline_admits_nothing() {
        let manager = ChannelManager::new();
        let admitted = manager
            .subscribe("chat.1", CountingRelease::new(false), None, ChannelPriority::High)
            .await;
        assert!(!admitted);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_budget_is_never_exceeded() {
        let manager = online_manager().await;
        for i in 0..15 {
            manager
                .subscribe(
                    format!("chat.{i}"),
                    CountingRelease::new(false),
                    None,
                    ChannelPriority::Medium,
                )
                .await;
        }
        assert_eq!(manager.count(), ConnectionQuality::Excellent.channel_budget());
    }

    #[tokio::test]
    async fn test_resubscribe_does_not_consume_budget() {
        let manager = online_manager().await;
        for _ in 0..3 {
            assert!(
                manager
                    .subscribe("chat.same", CountingRelease::new(false), None, ChannelPriority::Low)
                    .await
            );
        }
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_low_inactive_evicted_before_high_active() {
        let manager = online_manager().await;
        manager
            .subscribe("user.me", CountingRelease::new(false), None, ChannelPriority::High)
            .await;
        manager
            .subscribe("chat.idle", CountingRelease::new(false), None, ChannelPriority::Low)
            .await;
        manager.mark_inactive("chat.idle");

        for i in 0..9 {
            manager
                .subscribe(
                    format!("chat.{i}"),
                    CountingRelease::new(false),
                    None,
                    ChannelPriority::Medium,
                )
                .await;
        }

        assert_eq!(manager.count(), 10);
        assert!(manager.get("user.me").is_some());
        assert!(manager.get("chat.idle").is_none());
    }

    #[tokio::test]
    async fn test_high_protected_from_medium_incoming() {
        let manager = ChannelManager::new();
        manager
            .update_connection_quality(ConnectionQuality::Poor)
            .await;

        for i in 0..3 {
            manager
                .subscribe(
                    format!("vip.{i}"),
                    CountingRelease::new(false),
                    None,
                    ChannelPriority::High,
                )
                .await;
        }

        // Budget full of high-priority channels: a medium subscribe is refused
        let admitted = manager
            .subscribe("chat.x", CountingRelease::new(false), None, ChannelPriority::Medium)
            .await;
        assert!(!admitted);
        assert_eq!(manager.count(), 3);

        // An incoming high may evict a high
        let admitted = manager
            .subscribe("vip.new", CountingRelease::new(false), None, ChannelPriority::High)
            .await;
        assert!(admitted);
        assert_eq!(manager.count(), 3);
        assert!(manager.get("vip.new").is_some());
    }

    #[tokio::test]
    async fn test_quality_downgrade_evicts_immediately() {
        let manager = online_manager().await;
        manager
            .subscribe("user.me", CountingRelease::new(false), None, ChannelPriority::High)
            .await;
        for i in 0..9 {
            manager
                .subscribe(
                    format!("chat.{i}"),
                    CountingRelease::new(false),
                    None,
                    ChannelPriority::Medium,
                )
                .await;
        }
        assert_eq!(manager.count(), 10);

        manager
            .update_connection_quality(ConnectionQuality::Poor)
            .await;
        assert_eq!(manager.count(), 3);
        // The high-priority channel survived the downgrade
        assert!(manager.get("user.me").is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_tolerates_failing_release() {
        let manager = online_manager().await;
        let release = CountingRelease::new(true);
        manager
            .subscribe("chat.1", Arc::clone(&release) as Arc<dyn ChannelRelease>, None, ChannelPriority::Medium)
            .await;

        assert!(manager.unsubscribe("chat.1").await);
        assert_eq!(release.released.load(Ordering::SeqCst), 1);
        // The entry is gone despite the release error
        assert!(manager.get("chat.1").is_none());
        assert!(!manager.unsubscribe("chat.1").await);
    }

    #[tokio::test]
    async fn test_clear_drops_bookkeeping_without_release() {
        let manager = online_manager().await;
        let release = CountingRelease::new(false);
        manager
            .subscribe("chat.1", Arc::clone(&release) as Arc<dyn ChannelRelease>, None, ChannelPriority::Medium)
            .await;

        manager.clear();
        assert_eq!(manager.count(), 0);
        assert_eq!(release.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_channels() {
        let manager = ChannelManager::with_idle_timeout(Duration::ZERO);
        manager
            .update_connection_quality(ConnectionQuality::Excellent)
            .await;
        manager
            .subscribe("chat.idle", CountingRelease::new(false), None, ChannelPriority::Low)
            .await;
        manager
            .subscribe("chat.busy", CountingRelease::new(false), None, ChannelPriority::Low)
            .await;
        manager.mark_inactive("chat.idle");

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.sweep_idle().await;

        assert!(manager.get("chat.idle").is_none());
        assert!(manager.get("chat.busy").is_some());
    }
}
