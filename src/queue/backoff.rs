//! Exponential backoff with jitter for retryable apply failures.

use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

/// Delay before attempt `attempt` (1-based) is retried.
pub fn delay(config: &QueueConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exponential = config.backoff_base_ms.saturating_mul(1u64 << shift);
    let capped = exponential.min(config.backoff_cap_ms);
    let jitter = if config.backoff_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=config.backoff_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, cap: u64, jitter: u64) -> QueueConfig {
        QueueConfig {
            backoff_base_ms: base,
            backoff_cap_ms: cap,
            backoff_jitter_ms: jitter,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn test_doubles_per_attempt() {
        let c = config(100, 60_000, 0);
        assert_eq!(delay(&c, 1), Duration::from_millis(100));
        assert_eq!(delay(&c, 2), Duration::from_millis(200));
        assert_eq!(delay(&c, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_cap() {
        let c = config(100, 500, 0);
        assert_eq!(delay(&c, 10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounded() {
        let c = config(100, 60_000, 50);
        for _ in 0..32 {
            let d = delay(&c, 1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let c = config(u64::MAX / 2, u64::MAX, 0);
        let _ = delay(&c, u32::MAX);
    }
}
