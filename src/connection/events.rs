//! Typed event dispatch.
//!
//! The connection manager exposes a closed set of event names. Listener
//! invocation is synchronous and in registration order; a panicking
//! listener is isolated so it can neither starve its siblings nor crash
//! the dispatch loop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};

/// The closed set of event names the core dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// A new chat message arrived.
    MessageNew,
    /// A chat message was edited.
    MessageEdited,
    /// A chat message was deleted.
    MessageDeleted,
    /// A chat message was read by its recipient.
    MessageRead,
    /// Someone's typing state changed in a chat.
    Typing,
    /// A new match was created.
    MatchNew,
    /// Someone liked the local user.
    LikeNew,
    /// A generic in-app notification.
    Notification,
    /// An incoming voice/video call.
    IncomingCall,
    /// The unread counter for a chat changed.
    UnreadCountChanged,
    /// A chat-list entry got a new last message.
    ChatListMessage,
    /// A chat-list entry was updated.
    ChatListUpdated,
    /// A chat-list unread counter changed.
    ChatListUnreadChanged,
    /// The connection state changed.
    ConnectionStateChanged,
    /// A connection-level error (terminal when `can_retry` is false).
    ConnectionError,
    /// A member joined a presence group.
    PresenceJoined,
    /// A member left a presence group.
    PresenceLeft,
    /// Initial membership list of a presence group.
    PresenceHere,
    /// A presence member's typing state changed.
    PresenceTypingChanged,
    /// A presence member's online state changed.
    PresenceOnlineChanged,
}

impl EventKind {
    /// Maps a wire event name to a kind. Unknown names return `None` and
    /// are dropped at the boundary.
    #[must_use]
    pub fn from_wire(event: &str) -> Option<Self> {
        Some(match event {
            "message.new" => Self::MessageNew,
            "message.edited" => Self::MessageEdited,
            "message.deleted" => Self::MessageDeleted,
            "message.read" => Self::MessageRead,
            "chat.typing" => Self::Typing,
            "match.new" => Self::MatchNew,
            "like.new" => Self::LikeNew,
            "notification" => Self::Notification,
            "call.incoming" => Self::IncomingCall,
            "unread.changed" => Self::UnreadCountChanged,
            "chatlist.message" => Self::ChatListMessage,
            "chatlist.updated" => Self::ChatListUpdated,
            "chatlist.unread" => Self::ChatListUnreadChanged,
            "connection.state.changed" => Self::ConnectionStateChanged,
            "connection.error" => Self::ConnectionError,
            "presence.joined" => Self::PresenceJoined,
            "presence.left" => Self::PresenceLeft,
            "presence.here" => Self::PresenceHere,
            "presence.typing" => Self::PresenceTypingChanged,
            "presence.online" => Self::PresenceOnlineChanged,
            _ => return None,
        })
    }

    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageNew => "message.new",
            Self::MessageEdited => "message.edited",
            Self::MessageDeleted => "message.deleted",
            Self::MessageRead => "message.read",
            Self::Typing => "chat.typing",
            Self::MatchNew => "match.new",
            Self::LikeNew => "like.new",
            Self::Notification => "notification",
            Self::IncomingCall => "call.incoming",
            Self::UnreadCountChanged => "unread.changed",
            Self::ChatListMessage => "chatlist.message",
            Self::ChatListUpdated => "chatlist.updated",
            Self::ChatListUnreadChanged => "chatlist.unread",
            Self::ConnectionStateChanged => "connection.state.changed",
            Self::ConnectionError => "connection.error",
            Self::PresenceJoined => "presence.joined",
            Self::PresenceLeft => "presence.left",
            Self::PresenceHere => "presence.here",
            Self::PresenceTypingChanged => "presence.typing",
            Self::PresenceOnlineChanged => "presence.online",
        }
    }
}

/// A dispatched event: kind, originating channel, and the validated JSON
/// payload.
#[derive(Debug, Clone)]
pub struct RealtimeEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Channel the event arrived on, when channel-scoped.
    pub channel: Option<String>,
    /// Event payload.
    pub payload: Value,
}

impl RealtimeEvent {
    /// Creates an event without a channel.
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            channel: None,
            payload,
        }
    }

    /// Creates a channel-scoped event.
    pub fn on_channel(kind: EventKind, channel: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            channel: Some(channel.into()),
            payload,
        }
    }
}

/// Listener callback type.
pub type EventListener = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Handle identifying a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry and synchronous dispatcher for typed event listeners.
pub struct EventDispatcher {
    listeners: RwLock<HashMap<EventKind, Vec<(u64, EventListener)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener. Listeners for one kind run in registration
    /// order.
    pub fn on(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .entry(kind)
            .or_default()
            .push((id, listener));
        ListenerId(id)
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        if let Some(entries) = listeners.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id.0);
            return entries.len() != before;
        }
        false
    }

    /// Dispatches an event to every listener of its kind, synchronously
    /// and in registration order. A panicking listener is caught, logged,
    /// and does not prevent later listeners from running.
    pub fn emit(&self, event: &RealtimeEvent) {
        let callbacks: Vec<EventListener> = {
            let listeners = self.listeners.read().expect("listener registry poisoned");
            match listeners.get(&event.kind) {
                Some(entries) => entries.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    event = event.kind.as_str(),
                    panic = %detail,
                    "Event listener panicked; continuing with remaining listeners"
                );
            }
        }
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .expect("listener registry poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Removes every listener. Used on shutdown.
    pub fn clear(&self) {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        if !listeners.is_empty() {
            warn!(kinds = listeners.len(), "Clearing all event listeners");
        }
        listeners.clear();
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
