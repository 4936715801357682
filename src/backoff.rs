//! Reconnect delay policy.
//!
//! Failed connection attempts back off exponentially with jitter so a
//! fleet of bridges does not hammer the gateway in lockstep after an
//! outage. Server-requested reconnects skip the delay entirely.

use std::time::Duration;

use rand::Rng;

/// Fraction of the base delay added as random jitter.
const JITTER_FACTOR: f64 = 0.25;

/// Delay before reconnect attempt `attempt` (0-indexed).
///
/// Doubles from `base_ms` up to `max_ms`, then adds up to 25% jitter.
pub fn reconnect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jitter_range = (delay_ms as f64 * JITTER_FACTOR) as u64;
    let jitter = rand::rng().random_range(0..=jitter_range);

    Duration::from_millis(delay_ms + jitter)
}
