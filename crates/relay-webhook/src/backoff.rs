//! Exponential backoff with jitter for webhook retries.

use std::time::Duration;

/// Delay before retry number `retries`, with a random jitter.
///
/// Formula: `min(max, base * 2^retries) * (1 ± jitter)`, never above `max`.
#[must_use]
pub fn backoff_delay(retries: u32, base: Duration, max: Duration, jitter_factor: f64) -> Duration {
    backoff_delay_with_random(retries, base, max, jitter_factor, rand::random::<f64>())
}

/// [`backoff_delay`] with the random draw supplied by the caller.
///
/// `random` should be in `[0.0, 1.0)`; it maps linearly onto
/// `[-jitter_factor, +jitter_factor]`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay_with_random(
    retries: u32,
    base: Duration,
    max: Duration,
    jitter_factor: f64,
    random: f64,
) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let exponential = base_ms.saturating_mul(1u64 << retries.min(31));
    let capped = exponential.min(max_ms);

    let jitter = (random.mul_add(2.0, -1.0)).mul_add(jitter_factor.clamp(0.0, 1.0), 1.0);
    let with_jitter = ((capped as f64) * jitter).round().max(0.0) as u64;

    Duration::from_millis(with_jitter.min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(2);
    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn doubles_per_retry_without_jitter() {
        let delays: Vec<_> = (1..=4)
            .map(|r| backoff_delay_with_random(r, BASE, MAX, 0.25, 0.5))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(32),
            ]
        );
    }

    #[test]
    fn capped_at_max_even_with_positive_jitter() {
        assert_eq!(backoff_delay_with_random(10, BASE, MAX, 0.25, 0.999), MAX);
        assert_eq!(backoff_delay_with_random(40, BASE, MAX, 0.25, 0.999), MAX);
    }

    #[test]
    fn jitter_stays_within_band() {
        for _ in 0..200 {
            let delay = backoff_delay(2, BASE, MAX, 0.25);
            assert!(delay >= Duration::from_secs(6), "{delay:?}");
            assert!(delay <= Duration::from_secs(10), "{delay:?}");
        }
    }

    #[test]
    fn lowest_jitter_of_next_retry_never_undercuts_highest_of_previous() {
        for retries in 1..5 {
            let high = backoff_delay_with_random(retries, BASE, MAX, 0.25, 0.999);
            let low_next = backoff_delay_with_random(retries + 1, BASE, MAX, 0.25, 0.0);
            assert!(low_next >= high, "retry {retries}: {high:?} > {low_next:?}");
        }
    }
}
