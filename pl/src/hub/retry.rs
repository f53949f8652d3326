//! Reconnect backoff schedule

use std::time::Duration;

/// Default reconnect delays: immediately, then 2s, 5s, 10s, then every 30s
pub const DEFAULT_RECONNECT_DELAYS_MS: [u64; 5] = [0, 2_000, 5_000, 10_000, 30_000];

/// Decides how long to wait before each reconnect attempt
///
/// Attempt `n` waits `delays[n]`; once the list runs out the last delay
/// repeats. With `max_attempts` set the policy gives up after that many
/// attempts, otherwise it retries forever. An empty delay list disables
/// reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_RECONNECT_DELAYS_MS, None)
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>, max_attempts: Option<u32>) -> Self {
        Self { delays, max_attempts }
    }

    pub fn from_millis(delays_ms: &[u64], max_attempts: Option<u32>) -> Self {
        Self::new(delays_ms.iter().copied().map(Duration::from_millis).collect(), max_attempts)
    }

    /// Policy that never reconnects
    pub fn disabled() -> Self {
        Self::new(Vec::new(), None)
    }

    /// Delay before the next attempt, given how many attempts already failed
    ///
    /// Returns `None` when the policy gives up.
    pub fn next_delay(&self, previous_attempts: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| previous_attempts >= max) {
            return None;
        }
        let last = self.delays.len().checked_sub(1)?;
        let index = (previous_attempts as usize).min(last);
        self.delays.get(index).copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Option<Duration> {
        Some(Duration::from_millis(n))
    }

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), ms(0));
        assert_eq!(policy.next_delay(1), ms(2_000));
        assert_eq!(policy.next_delay(2), ms(5_000));
        assert_eq!(policy.next_delay(3), ms(10_000));
        assert_eq!(policy.next_delay(4), ms(30_000));
    }

    #[test]
    fn test_last_delay_repeats_forever() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(5), ms(30_000));
        assert_eq!(policy.next_delay(1_000), ms(30_000));
        assert_eq!(policy.max_attempts(), None);
    }

    #[test]
    fn test_max_attempts_gives_up() {
        let policy = RetryPolicy::from_millis(&[10, 20], Some(3));
        assert_eq!(policy.next_delay(0), ms(10));
        assert_eq!(policy.next_delay(1), ms(20));
        assert_eq!(policy.next_delay(2), ms(20));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_disabled_policy() {
        let policy = RetryPolicy::disabled();
        assert!(policy.delays().is_empty());
        assert_eq!(policy.next_delay(0), None);
    }
}
