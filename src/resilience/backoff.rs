//! Redial delays for upstream connections.

use std::time::Duration;

use rand::Rng;

/// Delay before the next dial after `failed_attempts` consecutive failures.
///
/// Doubles from `retry_ms` on every failure and stops growing at
/// `retry_max_ms`. Up to a tenth of the delay is added as jitter, so the
/// result may exceed the cap by that much.
pub fn redial_delay(failed_attempts: u32, retry_ms: u64, retry_max_ms: u64) -> Duration {
    if failed_attempts == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64.checked_shl(failed_attempts - 1).unwrap_or(u64::MAX);
    let delay = retry_ms.saturating_mul(factor).min(retry_max_ms.max(retry_ms));

    let spread = delay / 10;
    let jitter = if spread > 0 {
        rand::thread_rng().gen_range(0..spread)
    } else {
        0
    };
    Duration::from_millis(delay + jitter)
}
