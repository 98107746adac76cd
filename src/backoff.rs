//! Equal-jitter exponential backoff.
//!
//! `exp = min(cap, base * 2^attempt)`, delay is drawn from `[exp/2, exp]`.

use std::time::Duration;

use rand::Rng;

/// Delay before the next attempt. Negative attempts behave like attempt 0.
pub fn delay(attempt: i32, base: Duration, cap: Duration) -> Duration {
    delay_with_rng(attempt, base, cap, &mut rand::thread_rng())
}

pub fn delay_with_rng<R: Rng>(
    attempt: i32,
    base: Duration,
    cap: Duration,
    rng: &mut R,
) -> Duration {
    let exp = capped_exponential(attempt, base, cap);
    let half = exp / 2;
    let jitter = rng.gen_range(0..=exp - half);
    Duration::from_millis(half + jitter)
}

/// `min(cap, base * 2^attempt)` in milliseconds, saturating instead of overflowing.
fn capped_exponential(attempt: i32, base: Duration, cap: Duration) -> u64 {
    let attempt = attempt.max(0) as u32;
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}
