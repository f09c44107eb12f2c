use std::time::Duration;

use tessel_shared::constants::MAX_INBOX_ATTEMPTS;

/// Tunables for talking to cafes.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tries per request when the cafe cannot be reached.
    pub request_attempts: u32,

    /// Delay before the first retry, doubled for each one after.
    pub request_backoff: Duration,

    /// Per-request HTTP timeout. Streamed queries are bounded by their own
    /// wait instead.
    pub timeout: Duration,

    /// Handling failures after which a fetched inbox message is dropped.
    pub inbox_max_attempts: u32,

    /// Fetched messages handled per inbox pass.
    pub inbox_batch: usize,

    /// Interval between inbox sweeps when no cafe has pushed a notification.
    pub inbox_sweep: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_attempts: 3,
            request_backoff: Duration::from_millis(250),
            timeout: Duration::from_secs(30),
            inbox_max_attempts: MAX_INBOX_ATTEMPTS,
            inbox_batch: 50,
            inbox_sweep: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.request_backoff
            .saturating_mul(1u32 << retry.saturating_sub(1).min(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(250));
        assert_eq!(config.backoff_for(3), Duration::from_millis(1000));
    }
}
