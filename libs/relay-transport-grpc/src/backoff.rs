//! Jittered exponential backoff between connect attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Stateful delay sequence for one establish.
///
/// A fresh `Backoff` is created per establish; nothing is carried between
/// establishes.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    multiplier: f64,
    jitter: f64,
    max: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(cfg: &BackoffConfig) -> Self {
        let multiplier = if cfg.multiplier.is_finite() && cfg.multiplier >= 1.0 {
            cfg.multiplier
        } else {
            1.0
        };
        let jitter = if cfg.jitter.is_finite() {
            cfg.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            next: cfg.base.min(cfg.max),
            multiplier,
            jitter,
            max: cfg.max,
        }
    }

    /// Delay before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = Duration::try_from_secs_f64(self.next.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        self.spread(delay)
    }

    fn spread(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn delays_grow_geometrically_up_to_max() {
        let mut backoff = Backoff::new(&no_jitter());
        let delays: Vec<_> = (0..10).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_millis(1600));
        assert_eq!(delays[2], Duration::from_millis(2560));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = BackoffConfig::default();
        for _ in 0..100 {
            let delay = Backoff::new(&cfg).next_delay();
            assert!(delay >= Duration::from_millis(800), "{delay:?}");
            assert!(delay <= Duration::from_millis(1200), "{delay:?}");
        }
    }

    #[test]
    fn nonsense_parameters_are_tamed() {
        let cfg = BackoffConfig {
            base: Duration::from_secs(2),
            multiplier: f64::NAN,
            jitter: 7.0,
            max: Duration::from_secs(1),
        };
        let mut backoff = Backoff::new(&cfg);
        for _ in 0..5 {
            assert!(backoff.next_delay() <= Duration::from_secs(2));
        }
    }
}
