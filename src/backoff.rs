use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with optional jitter.
///
/// `duration()` yields `min * factor^attempt`, capped at `max`. With jitter
/// enabled the delay is drawn uniformly from `[min, computed]`, which keeps
/// restarting subscribers from synchronizing.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            min,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// The next delay; advances the attempt counter.
    pub fn duration(&mut self) -> Duration {
        let exp = self.factor.powi(self.attempt as i32);
        let computed = self.min.as_secs_f64() * exp;
        let capped = computed.min(self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let delay = if self.jitter && capped > self.min.as_secs_f64() {
            rand::thread_rng().gen_range(self.min.as_secs_f64()..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }

    /// Resets the attempt counter after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
