//! Bounded outbound message queue.
//!
//! Typing, read, and chat-adjacent actions attempted while the connection
//! is down are buffered here and replayed FIFO on the next successful
//! connect. The queue is bounded: overflow drops the oldest non-priority
//! entry, and every drop is logged; nothing is lost without a trace.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, warn};

/// Kind of a buffered outbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    /// A chat message send.
    Message,
    /// A read receipt.
    Read,
    /// A typing indicator.
    Typing,
    /// A raw client event.
    Event,
}

impl OutboundKind {
    /// Lower-case name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Read => "read",
            Self::Typing => "typing",
            Self::Event => "event",
        }
    }
}

/// One buffered outbound action.
#[derive(Debug, Clone)]
pub struct QueuedOutboundMessage {
    /// Action kind.
    pub kind: OutboundKind,
    /// Target chat, when chat-scoped.
    pub chat_id: Option<String>,
    /// Wire event name.
    pub event: String,
    /// Payload.
    pub payload: Value,
    /// Enqueue timestamp (ms since epoch).
    pub queued_at: i64,
    /// Replay attempts so far.
    pub retry_count: u32,
    /// Priority entries survive overflow.
    pub priority: bool,
}

impl QueuedOutboundMessage {
    /// Creates an entry stamped with the current time.
    pub fn new(
        kind: OutboundKind,
        chat_id: Option<String>,
        event: impl Into<String>,
        payload: Value,
        priority: bool,
    ) -> Self {
        Self {
            kind,
            chat_id,
            event: event.into(),
            payload,
            queued_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            priority,
        }
    }
}

/// Bounded FIFO queue of outbound actions buffered across disconnects.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: Mutex<VecDeque<QueuedOutboundMessage>>,
    capacity: usize,
    max_retries: u32,
}

impl OutboundQueue {
    /// Creates a queue with the given capacity and per-entry retry budget.
    pub fn new(capacity: usize, max_retries: u32) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            max_retries,
        }
    }

    /// Enqueues an action. On overflow the oldest non-priority entry is
    /// dropped (or the oldest entry outright when everything is priority).
    pub fn push(&self, message: QueuedOutboundMessage) {
        let mut entries = self.entries.lock().expect("outbound queue poisoned");
        if entries.len() >= self.capacity {
            let victim_idx = entries
                .iter()
                .position(|entry| !entry.priority)
                .unwrap_or(0);
            if let Some(dropped) = entries.remove(victim_idx) {
                warn!(
                    kind = dropped.kind.as_str(),
                    chat_id = ?dropped.chat_id,
                    queued_at = dropped.queued_at,
                    "Outbound queue overflow, dropping oldest entry"
                );
            }
        }
        debug!(
            kind = message.kind.as_str(),
            chat_id = ?message.chat_id,
            "Buffered outbound action while disconnected"
        );
        entries.push_back(message);
    }

    /// Takes every queued entry, in FIFO order, for replay.
    pub fn drain(&self) -> Vec<QueuedOutboundMessage> {
        let mut entries = self.entries.lock().expect("outbound queue poisoned");
        entries.drain(..).collect()
    }

    /// Puts a failed entry back at the front, burning one retry. Entries
    /// that exhaust their budget are dropped with a warning.
    ///
    /// Returns whether the entry was requeued.
    pub fn requeue_failed(&self, mut message: QueuedOutboundMessage) -> bool {
        message.retry_count += 1;
        if message.retry_count > self.max_retries {
            warn!(
                kind = message.kind.as_str(),
                chat_id = ?message.chat_id,
                retries = message.retry_count - 1,
                "Dropping outbound action after exhausting its retry budget"
            );
            return false;
        }
        self.entries
            .lock()
            .expect("outbound queue poisoned")
            .push_front(message);
        true
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("outbound queue poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every buffered entry (logout).
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("outbound queue poisoned");
        if !entries.is_empty() {
            warn!(dropped = entries.len(), "Clearing outbound queue");
        }
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(kind: OutboundKind, priority: bool) -> QueuedOutboundMessage {
        QueuedOutboundMessage::new(kind, Some("chat-1".into()), "message.send", json!({}), priority)
    }

    #[test]
    fn test_fifo_drain() {
        let queue = OutboundQueue::new(10, 3);
        for i in 0..3 {
            let mut msg = entry(OutboundKind::Typing, false);
            msg.payload = json!({ "n": i });
            queue.push(msg);
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        for (i, msg) in drained.iter().enumerate() {
            assert_eq!(msg.payload["n"], i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest_non_priority() {
        let queue = OutboundQueue::new(3, 3);
        queue.push(entry(OutboundKind::Message, true));
        queue.push(entry(OutboundKind::Typing, false));
        queue.push(entry(OutboundKind::Read, false));
        queue.push(entry(OutboundKind::Event, false));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        // The priority message survived; the oldest non-priority (typing) fell out
        assert_eq!(drained[0].kind, OutboundKind::Message);
        assert_eq!(drained[1].kind, OutboundKind::Read);
        assert_eq!(drained[2].kind, OutboundKind::Event);
    }

    #[test]
    fn test_overflow_all_priority_drops_oldest() {
        let queue = OutboundQueue::new(2, 3);
        let mut first = entry(OutboundKind::Message, true);
        first.payload = json!({"n": 0});
        queue.push(first);
        let mut second = entry(OutboundKind::Message, true);
        second.payload = json!({"n": 1});
        queue.push(second);
        let mut third = entry(OutboundKind::Message, true);
        third.payload = json!({"n": 2});
        queue.push(third);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload["n"], 1);
        assert_eq!(drained[1].payload["n"], 2);
    }

    #[test]
    fn test_requeue_respects_retry_budget() {
        let queue = OutboundQueue::new(10, 2);
        let msg = entry(OutboundKind::Read, false);

        assert!(queue.requeue_failed(msg.clone()));
        let mut retried = queue.drain().pop().unwrap();
        assert_eq!(retried.retry_count, 1);

        retried.retry_count = 2;
        assert!(!queue.requeue_failed(retried));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_puts_entry_at_front() {
        let queue = OutboundQueue::new(10, 3);
        queue.push(entry(OutboundKind::Typing, false));
        queue.requeue_failed(entry(OutboundKind::Message, false));

        let drained = queue.drain();
        assert_eq!(drained[0].kind, OutboundKind::Message);
        assert_eq!(drained[1].kind, OutboundKind::Typing);
    }
}
