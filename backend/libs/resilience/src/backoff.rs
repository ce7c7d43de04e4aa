/// Exponential backoff with jitter
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor applied after every delay
    pub multiplier: f64,
    /// Add random jitter to each delay (±30%)
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Stateful delay generator. Call [`Backoff::reset`] once the guarded
/// operation succeeds so the next failure starts from `initial` again.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.config.max);
        self.attempts = self.attempts.saturating_add(1);

        let grown = (self.current.as_millis() as f64 * self.config.multiplier)
            .min(self.config.max.as_millis() as f64);
        self.current = Duration::from_millis(grown as u64);

        if self.config.jitter {
            apply_jitter(base).min(self.config.max)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

fn apply_jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-0.3..0.3);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
