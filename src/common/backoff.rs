//! Jittered exponential backoff for retryable failures.
//!
//! Used by the REST retry loop, the streaming reconnector, and the
//! reconciler's indefinite cancel retries.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// Each call to `next_delay` doubles the base delay up to `max`, then
/// draws a uniform value in `[base/2, base]` so concurrent retriers do
/// not stampede.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// REST retry policy: 1 s doubling to 16 s.
    pub fn for_rest() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(16))
    }

    /// Streaming reconnect policy: 250 ms doubling to 30 s.
    pub fn for_stream() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next jittered delay, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;

        let base_ms = base.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(base_ms / 2..=base_ms);
        Duration::from_millis(jittered)
    }

    /// Reset to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));

        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(50) && d1 <= Duration::from_millis(100));

        let d2 = backoff.next_delay();
        assert!(d2 >= Duration::from_millis(100) && d2 <= Duration::from_millis(200));

        // Past the cap, the base stays at max
        backoff.next_delay();
        let d4 = backoff.next_delay();
        assert!(d4 >= Duration::from_millis(200) && d4 <= Duration::from_millis(400));
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let d = backoff.next_delay();
        assert!(d <= Duration::from_millis(100));
    }
}
