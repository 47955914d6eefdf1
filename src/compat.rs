//! Legacy callback adapters.
//!
//! Older application code registered flat callback bundles instead of
//! typed listeners. These shims translate that shape onto the typed event
//! API at the boundary; no core logic lives here.

use std::sync::Arc;

use serde_json::Value;

use crate::connection::{ConnectionManager, EventKind, ListenerId, RealtimeEvent};

/// Callback type of the legacy API.
pub type LegacyCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// The flat callback bundle older screens registered in one call.
#[derive(Clone, Default)]
pub struct GlobalCallbacks {
    /// New, edited, and deleted chat messages.
    pub on_message: Option<LegacyCallback>,
    /// Typing state changes.
    pub on_typing: Option<LegacyCallback>,
    /// New matches and likes.
    pub on_match: Option<LegacyCallback>,
    /// Generic notifications and incoming calls.
    pub on_notification: Option<LegacyCallback>,
    /// Connection state changes.
    pub on_connection_change: Option<LegacyCallback>,
}

/// Handle to the listener registrations created by
/// [`set_global_callbacks`]; dropping it does nothing, pass it to
/// [`clear_global_callbacks`] to detach.
pub struct GlobalCallbackRegistration {
    listeners: Vec<(EventKind, ListenerId)>,
}

/// Registers a legacy callback bundle over the typed event API.
pub fn set_global_callbacks(
    connection: &ConnectionManager,
    callbacks: GlobalCallbacks,
) -> GlobalCallbackRegistration {
    let mut listeners = Vec::new();

    let mut forward = |kinds: &[EventKind], callback: Option<LegacyCallback>| {
        let Some(callback) = callback else { return };
        for &kind in kinds {
            let callback = Arc::clone(&callback);
            let id = connection.on(
                kind,
                Arc::new(move |event: &RealtimeEvent| callback(event.payload.clone())),
            );
            listeners.push((kind, id));
        }
    };

    forward(
        &[
            EventKind::MessageNew,
            EventKind::MessageEdited,
            EventKind::MessageDeleted,
        ],
        callbacks.on_message,
    );
    forward(&[EventKind::Typing], callbacks.on_typing);
    forward(&[EventKind::MatchNew, EventKind::LikeNew], callbacks.on_match);
    forward(
        &[EventKind::Notification, EventKind::IncomingCall],
        callbacks.on_notification,
    );
    forward(
        &[EventKind::ConnectionStateChanged],
        callbacks.on_connection_change,
    );

    GlobalCallbackRegistration { listeners }
}

/// Detaches a previously registered callback bundle.
pub fn clear_global_callbacks(
    connection: &ConnectionManager,
    registration: GlobalCallbackRegistration,
) {
    for (kind, id) in registration.listeners {
        connection.off(kind, id);
    }
}

/// Legacy chat-list subscription: one callback over the three chat-list
/// events.
pub fn subscribe_to_chat_list(
    connection: &ConnectionManager,
    callback: LegacyCallback,
) -> GlobalCallbackRegistration {
    let mut listeners = Vec::new();
    for kind in [
        EventKind::ChatListMessage,
        EventKind::ChatListUpdated,
        EventKind::ChatListUnreadChanged,
    ] {
        let callback = Arc::clone(&callback);
        let id = connection.on(
            kind,
            Arc::new(move |event: &RealtimeEvent| callback(event.payload.clone())),
        );
        listeners.push((kind, id));
    }
    GlobalCallbackRegistration { listeners }
}
