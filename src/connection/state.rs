//! Connection state, quality estimation, and metrics.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};

/// Connection lifecycle state.
///
/// Owned exclusively by the connection manager; every transition drives
/// dependent behavior (heartbeat start/stop, channel clearing, outbound
/// queue replay).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; no reconnect pending.
    Disconnected = 0,
    /// Establishing a connection.
    Connecting = 1,
    /// Connected and authenticated.
    Connected = 2,
    /// Connection lost; a reconnect timer is pending.
    Reconnecting = 3,
    /// Reconnection exhausted or no credential; terminal until an explicit
    /// `connect()`.
    Failed = 4,
}

impl ConnectionState {
    /// Converts a `u8` back to a state.
    #[inline]
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Failed,
        }
    }

    /// The `u8` representation.
    #[inline]
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Lower-case name used in wire events and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measured connection quality, derived from heartbeat round-trip latency.
///
/// The channel manager reads this to size its budget.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionQuality {
    /// No connection.
    Offline = 0,
    /// Latency at or above 300ms, or heartbeat timeouts.
    Poor = 1,
    /// Latency under 300ms.
    Good = 2,
    /// Latency under 100ms.
    Excellent = 3,
}

impl ConnectionQuality {
    /// Derives quality from a round-trip latency sample in milliseconds.
    #[must_use]
    pub fn from_latency_ms(latency_ms: i64) -> Self {
        if latency_ms < 100 {
            Self::Excellent
        } else if latency_ms < 300 {
            Self::Good
        } else {
            Self::Poor
        }
    }

    /// Converts a `u8` back to a quality level.
    #[inline]
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            3 => Self::Excellent,
            2 => Self::Good,
            1 => Self::Poor,
            _ => Self::Offline,
        }
    }

    /// The `u8` representation.
    #[inline]
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Maximum number of concurrently open channels at this quality.
    #[must_use]
    pub fn channel_budget(self) -> usize {
        match self {
            Self::Excellent => 10,
            Self::Good => 7,
            Self::Poor => 3,
            Self::Offline => 0,
        }
    }

    /// Lower-case name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection metrics (lock-free).
#[derive(Debug)]
pub struct ConnectionMetrics {
    quality: AtomicU8,
    last_latency_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
    last_connected_at: AtomicI64,
    last_disconnected_at: AtomicI64,
}

impl ConnectionMetrics {
    /// Creates metrics with everything zeroed and quality `Offline`.
    pub fn new() -> Self {
        Self {
            quality: AtomicU8::new(ConnectionQuality::Offline.as_u8()),
            last_latency_ms: AtomicI64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_connected_at: AtomicI64::new(0),
            last_disconnected_at: AtomicI64::new(0),
        }
    }

    /// Current quality estimate.
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_u8(self.quality.load(Ordering::Acquire))
    }

    /// Sets the quality estimate. Returns the previous value.
    pub fn set_quality(&self, quality: ConnectionQuality) -> ConnectionQuality {
        ConnectionQuality::from_u8(self.quality.swap(quality.as_u8(), Ordering::AcqRel))
    }

    /// Records a latency sample and returns the quality derived from it.
    pub fn record_latency(&self, latency_ms: i64) -> ConnectionQuality {
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        let quality = ConnectionQuality::from_latency_ms(latency_ms);
        self.set_quality(quality);
        quality
    }

    /// Records a successful connection: timestamps it and resets the
    /// reconnect counter.
    pub fn record_connected(&self) {
        self.last_connected_at
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Release);
    }

    /// Records a disconnection timestamp.
    pub fn record_disconnected(&self) {
        self.last_disconnected_at
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Increments and returns the reconnect attempt counter.
    pub fn increment_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current reconnect attempt count.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Resets everything. Used on explicit reconnect.
    pub fn reset(&self) {
        self.quality
            .store(ConnectionQuality::Offline.as_u8(), Ordering::Release);
        self.last_latency_ms.store(0, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Release);
    }

    /// Immutable snapshot of the current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            quality: self.quality(),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Acquire),
            last_connected_at: self.last_connected_at.load(Ordering::Relaxed),
            last_disconnected_at: self.last_disconnected_at.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of [`ConnectionMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Current quality estimate.
    pub quality: ConnectionQuality,
    /// Most recent round-trip latency sample in milliseconds.
    pub last_latency_ms: i64,
    /// Consecutive reconnect attempts.
    pub reconnect_attempts: u32,
    /// Timestamp of the last successful connection (ms since epoch).
    pub last_connected_at: i64,
    /// Timestamp of the last disconnection (ms since epoch).
    pub last_disconnected_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_u8_roundtrip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Failed);
    }

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(
            ConnectionQuality::from_latency_ms(40),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::from_latency_ms(99),
            ConnectionQuality::Excellent
        );
        assert_eq!(ConnectionQuality::from_latency_ms(100), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_latency_ms(299), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_latency_ms(300), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::from_latency_ms(2500), ConnectionQuality::Poor);
    }

    #[test]
    fn test_quality_budgets() {
        assert_eq!(ConnectionQuality::Excellent.channel_budget(), 10);
        assert_eq!(ConnectionQuality::Good.channel_budget(), 7);
        assert_eq!(ConnectionQuality::Poor.channel_budget(), 3);
        assert_eq!(ConnectionQuality::Offline.channel_budget(), 0);
    }

    #[test]
    fn test_metrics_reconnect_counter_reset_on_connect() {
        let metrics = ConnectionMetrics::new();
        assert_eq!(metrics.increment_reconnect_attempts(), 1);
        assert_eq!(metrics.increment_reconnect_attempts(), 2);

        metrics.record_connected();
        assert_eq!(metrics.reconnect_attempts(), 0);
        assert!(metrics.snapshot().last_connected_at > 0);
    }

    #[test]
    fn test_metrics_latency_drives_quality() {
        let metrics = ConnectionMetrics::new();
        assert_eq!(metrics.record_latency(50), ConnectionQuality::Excellent);
        assert_eq!(metrics.quality(), ConnectionQuality::Excellent);
        assert_eq!(metrics.record_latency(450), ConnectionQuality::Poor);
        assert_eq!(metrics.snapshot().last_latency_ms, 450);
    }
}
