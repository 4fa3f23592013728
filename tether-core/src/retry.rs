//! Bounded exponential backoff with jitter.
//!
//! [`Retrier::next`] is a pure function of the attempt number: the caller owns
//! the counter (one per failure streak) and resets it on success.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Fraction of the capped delay applied as ± jitter by default.
pub const DEFAULT_JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct Retrier {
    enabled: bool,
    /// 0 means unlimited.
    max_attempts: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Retrier {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts,
            base,
            max: max.max(base),
            jitter: DEFAULT_JITTER,
        }
    }

    /// A policy whose [`next`](Self::next) always says "do not retry".
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO, Duration::ZERO, 0)
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self::new(config.backoff, config.max_backoff, config.attempts)
    }

    /// Override the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt + 1`, or `None` when the caller must
    /// give up. `attempt` counts the retries already made in this streak.
    pub fn next(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return None;
        }

        // capped = min(base * 2^attempt, max)
        let base_ms = self.base.as_millis();
        let max_ms = self.max.as_millis();
        let multiplier = 1u128.checked_shl(attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        let delay_ms = if self.jitter > 0.0 && capped_ms > 0 {
            let spread = capped_ms as f64 * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            ((capped_ms as f64 + offset).max(0.0) as u128).min(max_ms)
        } else {
            capped_ms
        };

        Some(Duration::from_millis(delay_ms.min(u64::MAX as u128) as u64))
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_and_caps() {
        let retrier = Retrier::new(Duration::from_millis(100), Duration::from_millis(500), 0)
            .with_jitter(0.0);
        assert_eq!(retrier.next(0), Some(Duration::from_millis(100)));
        assert_eq!(retrier.next(1), Some(Duration::from_millis(200)));
        assert_eq!(retrier.next(2), Some(Duration::from_millis(400)));
        assert_eq!(retrier.next(3), Some(Duration::from_millis(500)));
        assert_eq!(retrier.next(40), Some(Duration::from_millis(500)));
    }

    #[test]
    fn stops_after_max_attempts() {
        let retrier = Retrier::new(Duration::from_millis(10), Duration::from_secs(1), 3);
        assert!(retrier.next(2).is_some());
        assert!(retrier.next(3).is_none());
        assert!(retrier.next(100).is_none());
    }

    #[test]
    fn disabled_never_retries() {
        let retrier = Retrier::disabled();
        assert!(!retrier.is_enabled());
        assert!(retrier.next(0).is_none());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let retrier = Retrier::new(Duration::from_millis(1000), Duration::from_millis(1500), 0)
            .with_jitter(0.2);
        for _ in 0..200 {
            let first = retrier.next(0).expect("delay");
            assert!(first >= Duration::from_millis(800), "{first:?}");
            assert!(first <= Duration::from_millis(1200), "{first:?}");

            let capped = retrier.next(5).expect("delay");
            assert!(capped >= Duration::from_millis(1200), "{capped:?}");
            assert!(capped <= Duration::from_millis(1500), "{capped:?}");
        }
    }

    #[test]
    fn same_input_same_bounds_without_jitter() {
        let retrier = Retrier::new(Duration::from_millis(250), Duration::from_secs(60), 12)
            .with_jitter(0.0);
        assert_eq!(retrier.next(4), retrier.next(4));
    }

    #[test]
    fn disabled_config_maps_to_disabled_policy() {
        let config = RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        };
        assert!(Retrier::from_config(&config).next(0).is_none());
    }
}
