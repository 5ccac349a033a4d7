//! Exponential backoff for transient HTTP failures.

use conduit_types::ApiError;
use rand::Rng;

/// How often and how patiently a failed POST is repeated.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Milliseconds to wait before retry number `attempt` (0-based).
    ///
    /// A server-supplied `Retry-After` wins over the computed backoff. Both
    /// are capped at `max_delay_ms`; the computed value carries ±25% jitter.
    pub fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
        if let Some(server_delay) = retry_after_ms {
            return server_delay.min(self.max_delay_ms);
        }
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let jittered = base.min(self.max_delay_ms as f64) * rand::rng().random_range(0.75..=1.25);
        (jittered as u64).min(self.max_delay_ms)
    }
}

/// Rate limits, overload, 5xx and connection failures are worth retrying.
/// Everything else, including cancellation, is final.
pub fn is_transient(error: &ApiError) -> bool {
    matches!(
        error,
        ApiError::RateLimited { .. }
            | ApiError::Overloaded
            | ApiError::Server { .. }
            | ApiError::Network(_)
            | ApiError::Timeout
    )
}
