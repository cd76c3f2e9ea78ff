//! Exponential backoff with jitter
//!
//! Used by the registrar retry window and by resolver watch loops so that a
//! failing backend is never hammered in a tight loop.

use std::time::Duration;

use rand::Rng;

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for a single delay (before jitter)
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0), randomizes the delay by +/- this fraction
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for attempt n (0-indexed)
    ///
    /// Attempt 0 returns zero (no delay for the first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random::<f64>();
        self.delay_for_attempt_with_jitter(attempt, jitter)
    }

    /// Calculate delay with an explicit jitter sample in `[0.0, 1.0]`
    pub fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_us = self.initial_delay.as_micros() as f64 * self.multiplier.powi(exponent);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        // Map jitter from [0, 1] to [-1, 1]
        let jitter_range = base_us * self.jitter_factor;
        let jitter_offset = (jitter.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_range;
        let final_us = (base_us + jitter_offset).max(1.0);

        Duration::from_micros(final_us as u64)
    }
}
