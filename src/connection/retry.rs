//! Retry budgets and backoff arithmetic
//!
//! Shared by the hard-init retry path, the fallback poller, and the send
//! queue's rate-limit retries.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Fraction of the computed delay added as random jitter
pub const JITTER_RATIO: f64 = 0.2;

/// `base * 2^exponent`, optionally capped
pub fn exponential_backoff(base: Duration, exponent: u32, cap: Option<Duration>) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    let delay = base.saturating_mul(factor);
    match cap {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// Add up to `ratio * delay` of uniform random jitter
pub fn with_jitter(delay: Duration, ratio: f64) -> Duration {
    let max_jitter = delay.as_secs_f64() * ratio.max(0.0);
    if max_jitter <= 0.0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0.0..max_jitter);
    delay + Duration::from_secs_f64(jitter)
}

/// Uniform random delay in `[min, max]`
pub fn uniform_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Bounded attempt counter with an optional cooldown.
///
/// The count never exceeds `max_attempts`; once exhausted the owner either
/// gives up or starts the cooldown, after which the budget resets.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    attempt_count: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            base_delay,
            max_delay,
            cooldown: Duration::ZERO,
            cooldown_until: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Consume one attempt. Returns the new count, or `None` when exhausted.
    pub fn record_attempt(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt_count += 1;
        Some(self.attempt_count)
    }

    /// Jittered exponential delay before retry number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = exponential_backoff(
            self.base_delay,
            attempt.saturating_sub(1),
            Some(self.max_delay),
        );
        with_jitter(delay, JITTER_RATIO)
    }

    /// Random delay between the base and max delays
    pub fn randomized_delay(&self) -> Duration {
        uniform_between(self.base_delay, self.max_delay)
    }

    pub fn start_cooldown(&mut self, now: Instant) -> Duration {
        self.cooldown_until = Some(now + self.cooldown);
        self.cooldown
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.cooldown_until = None;
    }
}
