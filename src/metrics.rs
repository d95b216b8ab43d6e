use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for the shared connection.
///
/// Use `snapshot()` for a point-in-time view, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Reconnections: {}", metrics.reconnections());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    sends_dropped_total: AtomicU64,
    parse_failures_total: AtomicU64,
    handler_panics_total: AtomicU64,
    pings_received_total: AtomicU64,
    ping_timeouts_total: AtomicU64,
    reconnect_give_ups_total: AtomicU64,

    timestamps: RwLock<Timestamps>,
}

#[derive(Debug, Default)]
struct Timestamps {
    last_connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Sockets that completed the handshake
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Backoff retries scheduled
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Data messages delivered to the dispatcher
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Outbound payloads handed to the socket (pongs included)
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Outbound payloads dropped because no socket was open
    pub fn sends_dropped(&self) -> u64 {
        self.sends_dropped_total.load(Ordering::Relaxed)
    }

    /// Inbound frames that were not valid JSON messages
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures_total.load(Ordering::Relaxed)
    }

    /// Handler invocations that panicked
    pub fn handler_panics(&self) -> u64 {
        self.handler_panics_total.load(Ordering::Relaxed)
    }

    /// Server heartbeats seen
    pub fn pings_received(&self) -> u64 {
        self.pings_received_total.load(Ordering::Relaxed)
    }

    /// Sockets closed by the liveness monitor
    pub fn ping_timeouts(&self) -> u64 {
        self.ping_timeouts_total.load(Ordering::Relaxed)
    }

    /// Times the backoff ran out of attempts
    pub fn reconnect_give_ups(&self) -> u64 {
        self.reconnect_give_ups_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.timestamps.write().last_connected_at = Some(Instant::now());
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
        self.timestamps.write().last_message_at = Some(Instant::now());
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_dropped(&self) {
        self.sends_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parse_failure(&self) {
        self.parse_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_panic(&self) {
        self.handler_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping_timeout(&self) {
        self.ping_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_give_up(&self) {
        self.reconnect_give_ups_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timestamps = self.timestamps.read();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            sends_dropped_total: self.sends_dropped_total.load(Ordering::Acquire),
            parse_failures_total: self.parse_failures_total.load(Ordering::Acquire),
            handler_panics_total: self.handler_panics_total.load(Ordering::Acquire),
            pings_received_total: self.pings_received_total.load(Ordering::Acquire),
            ping_timeouts_total: self.ping_timeouts_total.load(Ordering::Acquire),
            reconnect_give_ups_total: self.reconnect_give_ups_total.load(Ordering::Acquire),
            time_since_connected: timestamps.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: timestamps.last_message_at.map(|t| t.elapsed()),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub sends_dropped_total: u64,
    pub parse_failures_total: u64,
    pub handler_panics_total: u64,
    pub pings_received_total: u64,
    pub ping_timeouts_total: u64,
    pub reconnect_give_ups_total: u64,
    /// Time since the last successful open (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Time since the last data message (None if none yet)
    pub time_since_last_message: Option<Duration>,
}
