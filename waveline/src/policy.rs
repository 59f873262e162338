//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential backoff schedule for reconnection attempts.
///
/// The delay before attempt `n` (zero-based failure count) is
/// `min(base_delay * 2^n, max_delay)`. Once `max_attempts` consecutive
/// attempts have failed the policy reports exhaustion and the connection
/// drops to the error state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
}

/// A scheduled reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    /// One-based attempt number.
    pub count: u32,
    /// How long to wait before opening the socket.
    pub delay: Duration,
    /// True once the failure budget is spent; no attempt should be made.
    pub exhausted: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::foreground()
    }
}

impl ReconnectPolicy {
    /// Schedule tuned for a foregrounded app: 1s base, 8s cap, 5 attempts.
    #[must_use]
    pub const fn foreground() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
        }
    }

    /// Schedule tuned for a backgrounded app: slower, more patient.
    #[must_use]
    pub const fn background() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30 * 60),
            max_attempts: 10,
        }
    }

    /// Computes the next attempt given the number of failures so far.
    #[must_use]
    pub fn attempt(&self, failures: u32) -> ReconnectAttempt {
        let exhausted = failures >= self.max_attempts;
        // Cap the exponent so the shift cannot overflow; max_delay clamps
        // the result well before 2^32 anyway.
        let factor = 1u32 << failures.min(20);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        ReconnectAttempt {
            count: failures.saturating_add(1),
            delay,
            exhausted,
        }
    }
}
