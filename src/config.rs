use rust_decimal::Decimal;
use std::time::Duration;

/// Tunables for the outgoing payment engine.
///
/// The defaults are safe for development; deployments override the fields
/// they care about and pass the record into `Dependencies`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fractional slippage tolerance handed to the streaming rate probe.
    pub slippage: Decimal,
    /// How long a quote stays honoured after it is struck.
    pub quote_lifespan: Duration,
    /// Bound for retryable quoting failures.
    pub max_quote_attempts: u32,
    /// Bound for retryable sending failures.
    pub max_send_attempts: u32,
    /// Worker poll delay when no payment is eligible.
    pub worker_idle_interval: Duration,
    /// Parallelism of the worker pool.
    pub worker_count: usize,
    /// Base of the exponential retry schedule.
    pub backoff_base: Duration,
    /// Ceiling of the exponential retry schedule.
    pub backoff_max: Duration,
    /// Deadline applied to every external capability call.
    pub external_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // 1% slippage tolerance.
            slippage: Decimal::new(1, 2),
            quote_lifespan: Duration::from_secs(5),
            max_quote_attempts: 5,
            max_send_attempts: 5,
            worker_idle_interval: Duration::from_millis(500),
            worker_count: 4,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            external_call_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Deterministic part of the retry schedule:
    /// `min(backoff_max, backoff_base * 2^attempt)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    /// Retry delay with jitter applied, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = jitter_up_to(self.backoff_base);
        (self.retry_delay(attempt) + jitter).min(self.backoff_max)
    }

    /// Idle poll interval with jitter, so workers do not thunder in step.
    pub fn idle_interval(&self) -> Duration {
        self.worker_idle_interval + jitter_up_to(self.worker_idle_interval / 4)
    }
}

fn jitter_up_to(max: Duration) -> Duration {
    use rand::Rng;
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
