//! Exponential reconnect backoff with jitter

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_FACTOR: u32 = 2;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u32,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            factor: DEFAULT_FACTOR,
            max_attempts: None,
            attempt: 0,
        }
    }

    /// Give up after this many consecutive failures
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }

    /// Un-jittered delay for the given attempt (0-based), capped at max
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Advance and return the next delay using the given jitter in `[0, 1]`.
    /// The result lies in `[ceiling / 2, ceiling]`. `None` once exhausted.
    pub fn next_delay_with(&mut self, jitter: f64) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        Some(half + half.mul_f64(jitter.clamp(0.0, 1.0)))
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        self.next_delay_with(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_cap() {
        let b = Backoff::default();
        assert_eq!(b.ceiling(0), Duration::from_millis(500));
        assert_eq!(b.ceiling(1), Duration::from_secs(1));
        assert_eq!(b.ceiling(2), Duration::from_secs(2));
        assert_eq!(b.ceiling(6), Duration::from_secs(30));
        assert_eq!(b.ceiling(60), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_half_and_full() {
        let mut b = Backoff::default();
        assert_eq!(b.next_delay_with(0.0), Some(Duration::from_millis(250)));
        assert_eq!(b.next_delay_with(1.0), Some(Duration::from_secs(1)));
        assert_eq!(b.attempt(), 2);

        for _ in 0..50 {
            let ceiling = b.ceiling(b.attempt());
            let d = b.next_delay().unwrap();
            assert!(d >= ceiling / 2 && d <= ceiling);
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay_with(1.0), Some(Duration::from_millis(500)));
    }

    #[test]
    fn max_attempts_exhausts() {
        let mut b = Backoff::default().with_max_attempts(2);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.exhausted());
        assert_eq!(b.next_delay(), None);
    }
}
