use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Reconnect pacing owned by the supervisor.
pub trait WsReconnectStrategy: Send + Sync + 'static {
    /// Delay before the next connect attempt. Counts as one attempt.
    fn next_delay(&mut self) -> Duration;
    /// Called on every successful `Connected` transition.
    fn reset(&mut self);
    fn should_retry(&self) -> bool;
    /// Attempts made since the last reset.
    fn attempts(&self) -> u32;
}

/// Capped exponential backoff with upward jitter.
///
/// Emitted delays never decrease between resets and never exceed `max`, so jitter spreads a
/// fleet of reconnecting clients without shortening any single client's wait.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffReconnect {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u32>,
    current: Duration,
    last: Duration,
    attempts: u32,
}

impl ExponentialBackoffReconnect {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            2.0
        };
        let max = max.max(base);
        Self {
            base,
            max,
            factor,
            jitter: 0.0,
            max_attempts: None,
            current: base,
            last: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Fraction of the current delay added at random, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoffReconnect {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0).with_jitter(0.2)
    }
}

impl WsReconnectStrategy for ExponentialBackoffReconnect {
    fn next_delay(&mut self) -> Duration {
        let delay = jitter_delay(self.current, self.jitter)
            .max(self.last)
            .min(self.max);
        self.last = delay;
        self.attempts = self.attempts.saturating_add(1);

        let next = (self.current.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
        self.current = Duration::try_from_secs_f64(next).unwrap_or(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
        self.last = Duration::ZERO;
        self.attempts = 0;
    }

    fn should_retry(&self) -> bool {
        self.max_attempts
            .is_none_or(|max_attempts| self.attempts < max_attempts)
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Stretch `base` by a random factor in `[1, 1 + jitter]`.
pub fn jitter_delay(base: Duration, jitter: f64) -> Duration {
    if base.is_zero() || jitter <= 0.0 {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let factor: f64 = 1.0 + rng.gen_range(0.0..=jitter);
    let nanos = (base.as_nanos() as f64 * factor) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}
