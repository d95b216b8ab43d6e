use crate::config::HealthConfig;
use tokio::time::{Duration, Instant};

/// Watchdog for server heartbeats on the current socket.
///
/// Armed when the socket opens and re-armed on each heartbeat. Expiry only
/// reports death; closing the socket and reconnecting is the caller's job.
#[derive(Debug)]
pub struct LivenessMonitor {
    config: HealthConfig,

    /// When the socket is declared dead unless re-armed
    deadline: Option<Instant>,

    /// Time of last heartbeat seen
    last_heartbeat: Option<Instant>,
}

impl LivenessMonitor {
    /// Create a disarmed monitor
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            deadline: None,
            last_heartbeat: None,
        }
    }

    /// Start (or restart) the countdown, e.g. when the socket opens
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.config.ping_timeout);
    }

    /// Record a heartbeat and restart the countdown
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.arm();
    }

    /// Stop the countdown (socket closed or being closed)
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether a countdown is running
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the current countdown expires
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the countdown ran out
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time since the last heartbeat, if any was seen
    pub fn since_last_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }
}
