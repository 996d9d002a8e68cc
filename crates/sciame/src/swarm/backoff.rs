use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Reconnect schedule of an address that failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Attempts that already failed.
    pub attempts: u32,
    pub next_attempt: Instant,
}

impl Backoff {
    pub fn new(now: Instant) -> Self {
        Self { attempts: 0, next_attempt: now }
    }

    /// `base * 2^attempts`, capped at `max`.
    pub fn delay(attempts: u32, base: Duration, max: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempts);
        base.saturating_mul(factor).min(max)
    }

    /// Record a failure and schedule the next attempt, with up to 10% of
    /// jitter. Returns false when no attempts are left.
    pub fn failed(
        &mut self,
        now: Instant,
        base: Duration,
        max: Duration,
        max_attempts: u32,
    ) -> bool {
        if self.attempts >= max_attempts {
            return false;
        }
        let delay = Self::delay(self.attempts, base, max);
        let jitter_ms = delay.as_millis() as u64 / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        self.attempts += 1;
        self.next_attempt = now + delay + jitter;
        true
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_and_capped() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        assert_eq!(Backoff::delay(0, base, max), Duration::from_secs(5));
        assert_eq!(Backoff::delay(1, base, max), Duration::from_secs(10));
        assert_eq!(Backoff::delay(3, base, max), Duration::from_secs(40));
        assert_eq!(Backoff::delay(7, base, max), max);
        assert_eq!(Backoff::delay(40, base, max), max);
    }

    #[test]
    fn attempts_run_out() {
        let now = Instant::now();
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        let mut backoff = Backoff::new(now);
        assert!(backoff.is_due(now));

        assert!(backoff.failed(now, base, max, 2));
        assert_eq!(backoff.attempts, 1);
        assert!(!backoff.is_due(now));
        assert!(backoff.next_attempt >= now + base);
        assert!(backoff.next_attempt <= now + base + base / 10);

        assert!(backoff.failed(now, base, max, 2));
        assert!(backoff.next_attempt >= now + base * 2);

        assert!(!backoff.failed(now, base, max, 2));
        assert_eq!(backoff.attempts, 2);
    }
}
