//! Exponential backoff shared by controller retries and link reconnects.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, for deterministic schedules.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`, then spread by up to `jitter` of itself either way.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self.base.saturating_mul(1u32 << attempt.min(31));
        let capped = doubled.min(self.max);
        if self.jitter.is_nan() || self.jitter <= 0.0 {
            return capped;
        }
        let spread = capped.mul_f64(self.jitter.min(1.0));
        capped.saturating_sub(spread) + spread.mul_f64(2.0 * unit_sample())
    }

    /// Same as [`delay`](Self::delay) as a chrono duration.
    pub fn delay_chrono(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay(attempt)).unwrap_or(chrono::Duration::MAX)
    }
}

/// Uniform-ish sample in `[0, 1)` from the wall clock, mixed with splitmix64.
fn unit_sample() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mut z = nanos.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
