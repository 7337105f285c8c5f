use std::time::Duration;

/// Exponential backoff carried as a value: the remaining attempts and the
/// next delay to wait. Consumed iteratively by retry loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    attempts_remaining: u32,
    next_delay: Duration,
}

impl ExponentialBackoff {
    /// Creates a policy allowing `max_retries` delayed re-attempts, starting
    /// at `initial_delay` and doubling after each one.
    #[must_use]
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            attempts_remaining: max_retries,
            next_delay: initial_delay,
        }
    }

    /// Returns the delay to wait before the next re-attempt, or `None` when
    /// retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_remaining == 0 {
            return None;
        }

        self.attempts_remaining -= 1;
        let delay = self.next_delay;
        self.next_delay = delay.saturating_mul(2);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ExponentialBackoff;

    #[test]
    fn delays_double_until_exhaustion() {
        let mut backoff = ExponentialBackoff::new(3, Duration::from_millis(20));

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(80)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn zero_retries_yields_nothing() {
        let mut backoff = ExponentialBackoff::new(0, Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), None);
    }
}
