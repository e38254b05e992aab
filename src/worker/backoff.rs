use std::time::Duration;

use rand::prelude::*;

/// Exponential backoff with jitter for retryable provider failures.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,
    /// Maximum backoff.
    pub max_backoff: Duration,
    /// Multiplier for each backoff round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(60),
            base: 2.,
        }
    }
}

/// Consecutive calls to [`Backoff::next`] return the next jittered interval.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .finish()
    }
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Uses [`rand::thread_rng()`] if no rng is provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for.
    pub fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_backoff_bounds() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(100),
            base: 3.,
        };

        // An rng pinned to the minimum of the range stays at the floor.
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));
        for _ in 0..10 {
            assert_eq!(backoff.next().as_secs_f64(), 1.);
        }

        // An rng pinned to the maximum grows geometrically up to the cap.
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));
        let mut expected = 1.0_f64;
        for _ in 0..10 {
            let next = backoff.next().as_secs_f64();
            assert!((next - expected).abs() < 0.0001, "{} != {}", next, expected);
            expected = (expected * 3.).min(100.);
        }
    }

    #[test]
    fn test_jittered_values_stay_in_range() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            base: 2.,
        };
        let mut backoff = Backoff::new(&config);
        for _ in 0..20 {
            let next = backoff.next();
            assert!(next >= Duration::from_millis(100));
            assert!(next <= Duration::from_secs(5));
        }
    }
}
