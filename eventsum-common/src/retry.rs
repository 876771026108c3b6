use std::time;

/// Backoff between attempts of the Period read-merge-write cycle.
///
/// A conflicting write means another flush updated the same bucket in the meantime. Under
/// sustained contention on one bucket every writer keeps losing the race, so attempts are
/// bounded: once `max_attempts` attempts were made the merge is abandoned and the caller is
/// expected to hand the Period to the failure sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first conflicting attempt.
    initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    maximum_interval: time::Duration,
    /// Total attempts, including the first one. Never zero.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow `attempts` attempts that all conflicted.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Time to wait after the given zero-based attempt conflicted.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(self.maximum_interval);

        std::cmp::min(candidate, self.maximum_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(5),
            maximum_interval: time::Duration::from_secs(1),
            max_attempts: 32,
        }
    }
}
