//! Channel budget and eviction-fairness properties.

use std::sync::Arc;

use async_trait::async_trait;

use emberlink::channels::{ChannelManager, ChannelPriority, ChannelRelease};
use emberlink::connection::ConnectionQuality;
use emberlink::error::Result;

struct NoopRelease;

#[async_trait]
impl ChannelRelease for NoopRelease {
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

fn handle() -> Arc<dyn ChannelRelease> {
    Arc::new(NoopRelease)
}

async fn manager_at(quality: ConnectionQuality) -> Arc<ChannelManager> {
    let manager = ChannelManager::new();
    manager.update_connection_quality(quality).await;
    manager
}

// P4: channel count never exceeds the quality-derived limit.
#[tokio::test]
async fn budget_never_exceeded_at_any_quality() {
    for quality in [
        ConnectionQuality::Excellent,
        ConnectionQuality::Good,
        ConnectionQuality::Poor,
    ] {
        let manager = manager_at(quality).await;
        for i in 0..25 {
            manager
                .subscribe(format!("chat.{i}"), handle(), None, ChannelPriority::Medium)
                .await;
        }
        assert_eq!(
            manager.count(),
            quality.channel_budget(),
            "quality {quality:?}"
        );
    }
}

// P4: downgrading quality while over the new limit evicts immediately,
// without waiting for the next subscribe.
#[tokio::test]
async fn downgrade_evicts_to_new_limit_immediately() {
    let manager = manager_at(ConnectionQuality::Excellent).await;
    for i in 0..10 {
        manager
            .subscribe(format!("chat.{i}"), handle(), None, ChannelPriority::Medium)
            .await;
    }
    assert_eq!(manager.count(), 10);

    manager
        .update_connection_quality(ConnectionQuality::Good)
        .await;
    assert_eq!(manager.count(), 7);

    manager
        .update_connection_quality(ConnectionQuality::Poor)
        .await;
    assert_eq!(manager.count(), 3);
}

// Scenario: excellent (10 open, mixed priorities) -> poor: exactly 7
// evicted, lowest-priority/oldest-inactive first, and no high-priority
// channel among them while non-high candidates remain.
#[tokio::test]
async fn downgrade_scenario_preserves_high_priority() {
    let manager = manager_at(ConnectionQuality::Excellent).await;

    manager
        .subscribe("user.me", handle(), None, ChannelPriority::High)
        .await;
    manager
        .subscribe("chat.active-vip", handle(), None, ChannelPriority::High)
        .await;
    for i in 0..4 {
        manager
            .subscribe(format!("chat.med-{i}"), handle(), None, ChannelPriority::Medium)
            .await;
    }
    for i in 0..4 {
        manager
            .subscribe(format!("chat.low-{i}"), handle(), None, ChannelPriority::Low)
            .await;
    }
    assert_eq!(manager.count(), 10);

    manager
        .update_connection_quality(ConnectionQuality::Poor)
        .await;

    assert_eq!(manager.count(), 3);
    // Both high-priority channels survived (2 high < budget 3)
    assert!(manager.get("user.me").is_some());
    assert!(manager.get("chat.active-vip").is_some());
    // Every low went first; at most one medium survived
    for i in 0..4 {
        assert!(manager.get(&format!("chat.low-{i}")).is_none());
    }
}

// P5: a low-priority inactive channel is always evicted before a
// high-priority active one.
#[tokio::test]
async fn eviction_prefers_low_inactive_over_high_active() {
    let manager = manager_at(ConnectionQuality::Poor).await;

    manager
        .subscribe("user.me", handle(), None, ChannelPriority::High)
        .await;
    manager
        .subscribe("chat.low", handle(), None, ChannelPriority::Low)
        .await;
    manager.mark_inactive("chat.low");
    manager
        .subscribe("chat.med", handle(), None, ChannelPriority::Medium)
        .await;
    assert_eq!(manager.count(), 3);

    // Admission at the cap: the low inactive channel is the victim
    manager
        .subscribe("chat.new", handle(), None, ChannelPriority::Medium)
        .await;

    assert_eq!(manager.count(), 3);
    assert!(manager.get("chat.low").is_none());
    assert!(manager.get("user.me").is_some());
    assert!(manager.get("chat.new").is_some());
}

// P5: high-priority channels are evicted only for an incoming high when
// no lower-tier candidates remain.
#[tokio::test]
async fn high_evicted_only_for_incoming_high() {
    let manager = manager_at(ConnectionQuality::Poor).await;
    for i in 0..3 {
        manager
            .subscribe(format!("vip.{i}"), handle(), None, ChannelPriority::High)
            .await;
    }

    assert!(
        !manager
            .subscribe("chat.med", handle(), None, ChannelPriority::Medium)
            .await
    );
    assert!(
        !manager
            .subscribe("chat.low", handle(), None, ChannelPriority::Low)
            .await
    );
    assert_eq!(manager.count(), 3);

    assert!(
        manager
            .subscribe("vip.incoming", handle(), None, ChannelPriority::High)
            .await
    );
    assert_eq!(manager.count(), 3);
    assert!(manager.get("vip.incoming").is_some());
}

// Offline admits nothing, regardless of priority.
#[tokio::test]
async fn offline_budget_is_zero() {
    let manager = manager_at(ConnectionQuality::Offline).await;
    assert!(
        !manager
            .subscribe("user.me", handle(), None, ChannelPriority::High)
            .await
    );
    assert_eq!(manager.count(), 0);
}
