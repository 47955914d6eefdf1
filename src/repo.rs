//! Local relational cache interface.
//!
//! The embedded SQL store lives outside the core; the connection manager
//! only needs to keep per-user notification counters fresh. Calls are
//! opportunistic: a failing repository is logged and never breaks the
//! real-time pipeline.

use async_trait::async_trait;

use crate::error::Result;

/// Per-user notification counter persistence.
#[async_trait]
pub trait NotificationCounterRepository: Send + Sync {
    /// Overwrites the unread-message counter.
    async fn set_unread_messages(&self, user_id: &str, count: u32) -> Result<()>;

    /// Bumps the unread-message counter by one.
    async fn increment_unread_messages(&self, user_id: &str) -> Result<()>;

    /// Bumps the new-likes counter by one.
    async fn increment_new_likes(&self, user_id: &str) -> Result<()>;

    /// Zeroes all counters for the user.
    async fn reset_counters(&self, user_id: &str) -> Result<()>;
}
