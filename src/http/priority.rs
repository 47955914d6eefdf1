//! Request priority classification and the bounded priority queue.
//!
//! Every outbound call is classified by its target resource into a tier,
//! then waits for a dispatch slot. Slots drain strictly high > medium >
//! low (FIFO within a tier) up to a fixed concurrency ceiling; enqueueing
//! a high-priority request proactively cancels every queued low-priority
//! entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Priority tier of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    /// Dropped first, dispatched last: analytics, telemetry.
    Low = 0,
    /// The default tier.
    Medium = 1,
    /// Auth, messaging, safety: dispatched first, never auto-cancelled.
    High = 2,
}

impl RequestPriority {
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

/// Maps a request path to a priority tier via URL-prefix rules.
#[derive(Debug, Clone)]
pub struct PriorityClassifier {
    rules: Vec<(String, RequestPriority)>,
}

impl PriorityClassifier {
    /// Classifier with the application's default routing table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: vec![
                ("/auth".to_string(), RequestPriority::High),
                ("/messages".to_string(), RequestPriority::High),
                ("/chats".to_string(), RequestPriority::High),
                ("/safety".to_string(), RequestPriority::High),
                ("/realtime".to_string(), RequestPriority::High),
                ("/analytics".to_string(), RequestPriority::Low),
                ("/telemetry".to_string(), RequestPriority::Low),
                ("/logs".to_string(), RequestPriority::Low),
            ],
        }
    }

    /// Adds or overrides a prefix rule.
    pub fn add_rule(&mut self, prefix: impl Into<String>, priority: RequestPriority) {
        self.rules.insert(0, (prefix.into(), priority));
    }

    /// Classifies a path. Unmatched paths are `Medium`.
    #[must_use]
    pub fn classify(&self, path: &str) -> RequestPriority {
        // Match against the path component only, so absolute URLs and
        // prefixed paths classify the same
        let path = path
            .strip_prefix("https://")
            .or_else(|| path.strip_prefix("http://"))
            .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or(path);
        let path = path.strip_prefix("/api/v1").unwrap_or(path);

        for (prefix, priority) in &self.rules {
            if path.starts_with(prefix.as_str()) {
                return *priority;
            }
        }
        RequestPriority::Medium
    }
}

impl Default for PriorityClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Default bound on entries waiting in the queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

struct QueueEntry {
    priority: RequestPriority,
    seq: u64,
    slot_tx: oneshot::Sender<()>,
}

struct QueueState {
    waiting: VecDeque<QueueEntry>,
    in_flight: usize,
    next_seq: u64,
}

/// A held dispatch slot. Dropping it releases the slot and wakes the next
/// queued entry.
pub struct DispatchSlot {
    queue: Arc<PriorityQueue>,
}

impl std::fmt::Debug for DispatchSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSlot").finish_non_exhaustive()
    }
}

impl Drop for DispatchSlot {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// Bounded priority queue gating request dispatch.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    ceiling: usize,
    capacity: usize,
    cancelled_total: AtomicUsize,
}

impl PriorityQueue {
    /// Creates a queue with the given concurrency ceiling and waiting-set
    /// capacity.
    pub fn new(ceiling: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                in_flight: 0,
                next_seq: 0,
            }),
            ceiling: ceiling.max(1),
            capacity,
            cancelled_total: AtomicUsize::new(0),
        })
    }

    /// Acquires a dispatch slot, waiting in priority order if the ceiling
    /// is reached.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the entry was evicted (a high-priority
    ///   enqueue cancels queued lows; overflow cancels the worst entry).
    /// - [`Error::ResourceExhausted`] if the waiting set is full and this
    ///   entry is the worst candidate.
    pub async fn acquire(self: Arc<Self>, priority: RequestPriority) -> Result<DispatchSlot> {
        let slot_rx = {
            let mut state = self.state.lock().expect("priority queue poisoned");

            if state.in_flight < self.ceiling && state.waiting.is_empty() {
                state.in_flight += 1;
                drop(state);
                return Ok(DispatchSlot { queue: self });
            }

            // High-priority arrivals proactively cancel queued lows: a
            // burst of telemetry must never delay an auth or message call
            if priority == RequestPriority::High {
                let before = state.waiting.len();
                state
                    .waiting
                    .retain(|entry| entry.priority != RequestPriority::Low);
                let cancelled = before - state.waiting.len();
                if cancelled > 0 {
                    self.cancelled_total.fetch_add(cancelled, Ordering::Relaxed);
                    debug!(cancelled, "Cancelled queued low-priority requests");
                }
            }

            if state.waiting.len() >= self.capacity {
                match self.make_room(&mut state, priority) {
                    Ok(()) => {}
                    Err(err) => return Err(err),
                }
            }

            let (slot_tx, slot_rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push_back(QueueEntry {
                priority,
                seq,
                slot_tx,
            });
            slot_rx
        };

        match slot_rx.await {
            Ok(()) => Ok(DispatchSlot { queue: self }),
            Err(_) => Err(Error::cancelled("Evicted from request priority queue")),
        }
    }

    /// Evicts the worst queued entry if it ranks strictly below the
    /// incoming priority; otherwise rejects the newcomer.
    fn make_room(&self, state: &mut QueueState, incoming: RequestPriority) -> Result<()> {
        let worst = state
            .waiting
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, std::cmp::Reverse(e.seq)))
            .map(|(idx, e)| (idx, e.priority));

        match worst {
            Some((idx, worst_priority)) if worst_priority < incoming => {
                // Dropping the sender resolves the evicted caller as cancelled
                state.waiting.remove(idx);
                self.cancelled_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    evicted = worst_priority.as_str(),
                    admitted = incoming.as_str(),
                    "Request queue overflow, evicted lower-priority entry"
                );
                Ok(())
            }
            _ => Err(Error::resource_exhausted(format!(
                "Request queue full ({} waiting)",
                state.waiting.len()
            ))),
        }
    }

    /// Releases a slot and wakes the best waiting entry, if any.
    fn release(&self) {
        let mut state = self.state.lock().expect("priority queue poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);

        // A woken caller may have given up (dropped its receiver); keep
        // popping until a live entry takes the slot
        while state.in_flight < self.ceiling {
            let best = state
                .waiting
                .iter()
                .enumerate()
                .max_by_key(|(_, e)| (e.priority, std::cmp::Reverse(e.seq)))
                .map(|(idx, _)| idx);

            let Some(idx) = best else { break };
            let entry = state.waiting.remove(idx).expect("index valid");
            if entry.slot_tx.send(()).is_ok() {
                state.in_flight += 1;
                break;
            }
        }
    }

    /// Number of entries currently waiting.
    pub fn waiting_len(&self) -> usize {
        self.state.lock().expect("priority queue poisoned").waiting.len()
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.state.lock().expect("priority queue poisoned").in_flight
    }

    /// Total number of entries cancelled by eviction so far.
    pub fn cancelled_total(&self) -> usize {
        self.cancelled_total.load(Ordering::Relaxed)
    }
}
