//! Heartbeat scheduling and liveness watchdog.

use std::time::Duration;

use tokio::time::Instant;

/// What the monitor wants done when a deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDue {
    /// Send a heartbeat probe frame.
    Probe,
    /// No inbound traffic arrived within the liveness window; the
    /// connection must be treated as dead.
    TimedOut,
}

/// Tracks the heartbeat probe schedule and the liveness watchdog.
///
/// A probe is due every `interval`. Sending a probe arms the watchdog: if no
/// inbound frame of any kind arrives within `timeout` of the oldest
/// unanswered probe, the monitor reports [`HeartbeatDue::TimedOut`]. Any
/// inbound frame disarms the watchdog, not just heartbeat echoes.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    next_probe: Option<Instant>,
    watchdog: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor with the given probe interval and liveness
    /// timeout.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_probe: None,
            watchdog: None,
        }
    }

    /// Starts (or restarts) the probe schedule from `now`.
    pub fn start(&mut self, now: Instant) {
        self.next_probe = Some(now + self.interval);
        self.watchdog = None;
    }

    /// Stops probing and disarms the watchdog.
    pub fn stop(&mut self) {
        self.next_probe = None;
        self.watchdog = None;
    }

    /// Whether the monitor is currently running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.next_probe.is_some()
    }

    /// The earliest instant at which [`Self::on_deadline`] should be called,
    /// or `None` while stopped.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match (self.next_probe, self.watchdog) {
            (Some(p), Some(w)) => Some(p.min(w)),
            (probe, watchdog) => probe.or(watchdog),
        }
    }

    /// Records inbound traffic. Disarms the watchdog; the probe schedule is
    /// unaffected.
    pub fn on_liveness(&mut self) {
        self.watchdog = None;
    }

    /// Resolves a fired deadline. Watchdog expiry wins over a due probe.
    pub fn on_deadline(&mut self, now: Instant) -> Option<HeartbeatDue> {
        if self.watchdog.is_some_and(|w| now >= w) {
            return Some(HeartbeatDue::TimedOut);
        }
        if self.next_probe.is_some_and(|p| now >= p) {
            self.next_probe = Some(now + self.interval);
            // Keep the watchdog anchored to the oldest unanswered probe so
            // repeated probes cannot push the timeout out indefinitely.
            self.watchdog = Some(self.watchdog.unwrap_or(now + self.timeout));
            return Some(HeartbeatDue::Probe);
        }
        None
    }
}
