//! Reconnect delay schedule.

use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (zero-based).
///
/// Doubles from `base` on every attempt. The shift is clamped so very large
/// attempt numbers saturate instead of overflowing.
#[must_use]
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(20))
}
