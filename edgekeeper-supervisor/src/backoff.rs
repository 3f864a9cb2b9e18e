//! Bounded exponential backoff between restarts

use edgekeeper_core::workload::BackoffConfig;
use std::time::Duration;

/// Stateful backoff series: `min`, `min * factor`, `min * factor^2`, ... capped at `max`.
///
/// The series is owned by one supervisor and lives as long as it does.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff series
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Duration for a given attempt without advancing the series
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let min = self.config.min.as_secs_f64();
        let max = self.config.max.as_secs_f64().max(min);
        let raw = min * self.config.factor.powi(attempt.min(i32::MAX as u32) as i32);

        let secs = if raw.is_finite() { raw.clamp(min, max) } else { max };
        Duration::from_secs_f64(secs)
    }

    /// Next delay; advances the series
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start the series over
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
