//! Push-notification presenter interface.
//!
//! Presentation is fire-and-forget, best-effort: errors are logged at the
//! call site and never propagated into the real-time pipeline.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::Result;

/// Presents notifications to the user.
#[async_trait]
pub trait NotificationPresenter: Send + Sync {
    /// Shows a generic notification.
    async fn show_notification(&self, title: &str, body: &str, data: &Value) -> Result<()>;

    /// Shows a chat-message notification.
    async fn show_message_notification(
        &self,
        message: &Value,
        chat_id: &str,
        sender_name: &str,
    ) -> Result<()>;
}

/// Presenter that only logs. Default for headless and test environments.
#[derive(Debug, Default)]
pub struct LogPresenter;

#[async_trait]
impl NotificationPresenter for LogPresenter {
    async fn show_notification(&self, title: &str, body: &str, _data: &Value) -> Result<()> {
        info!(title, body, "Notification");
        Ok(())
    }

    async fn show_message_notification(
        &self,
        _message: &Value,
        chat_id: &str,
        sender_name: &str,
    ) -> Result<()> {
        info!(chat_id, sender_name, "Message notification");
        Ok(())
    }
}
