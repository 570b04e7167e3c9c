//! Reconnection backoff.

use std::time::Duration;

/// Largest exponent applied to the base delay.
pub const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Exponential backoff: `base * 2^attempt`.
///
/// The attempt ceiling is enforced by the connection manager; this type only
/// computes delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Returns the delay before reconnection attempt `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
