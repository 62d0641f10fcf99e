use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Classification of request failures for retry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Provider signaled throttling (HTTP 429 or equivalent) - retry, grow the shared delay
    RateLimited,
    /// No response within the configured window - retry, grow the shared delay
    Timeout,
    /// Anything else - surface immediately, the request is not assumed idempotent
    Permanent,
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_retries: u32,
    /// Linear backoff step in milliseconds, multiplied by the attempt number
    pub retry_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Adaptive inter-request delay shared by every client wired into one process.
///
/// The delay starts at the floor, decays multiplicatively (x0.9) after each
/// success and doubles after each throttled or timed-out call, clamped to
/// [floor, ceiling]. One instance is injected into all provider clients, so
/// a burst of 429s on one endpoint slows unrelated subsequent calls too.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    delay_ms: Mutex<f64>,
    floor_ms: f64,
    ceiling_ms: f64,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Self {
        Self::with_bounds(100.0, 10_000.0)
    }

    /// Custom bounds, used by tests to keep wall-clock time down.
    pub fn with_bounds(floor_ms: f64, ceiling_ms: f64) -> Self {
        Self {
            delay_ms: Mutex::new(floor_ms),
            floor_ms,
            ceiling_ms,
        }
    }

    /// Current delay in milliseconds.
    pub fn current_delay_ms(&self) -> u64 {
        let delay = self.delay_ms.lock().unwrap_or_else(|e| e.into_inner());
        *delay as u64
    }

    /// Sleep for the current delay. Called before every outbound request.
    pub async fn pause(&self) {
        let delay = self.current_delay_ms();
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Slow-release decay after a successful call.
    pub fn on_success(&self) {
        let mut delay = self.delay_ms.lock().unwrap_or_else(|e| e.into_inner());
        *delay = (*delay * 0.9).max(self.floor_ms);
    }

    /// Double the delay after a throttled or timed-out call.
    pub fn on_throttle(&self) {
        let mut delay = self.delay_ms.lock().unwrap_or_else(|e| e.into_inner());
        *delay = (*delay * 2.0).min(self.ceiling_ms);
        warn!(
            "⚠️  Provider throttled, inter-request delay now {}ms",
            *delay as u64
        );
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run an async operation through the shared limiter with retry on
/// rate-limit/timeout failures.
///
/// Every attempt first waits out the limiter's current delay. Throttled and
/// timed-out attempts double that delay and retry after an additional linear
/// backoff of `retry_backoff_ms * attempt`, so waits are strictly increasing.
/// Permanent failures surface immediately. After `max_retries` retries the
/// last error is returned to the caller.
pub async fn execute_with_retry<F, Fut, T, E>(
    limiter: &AdaptiveRateLimiter,
    config: &RetryConfig,
    mut operation: F,
    classify: impl Fn(&E) -> FailureClass,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        limiter.pause().await;

        match operation().await {
            Ok(result) => {
                limiter.on_success();
                if attempt > 0 {
                    debug!("✅ Request succeeded after {} retry attempts", attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                let class = classify(&e);

                if class == FailureClass::Permanent {
                    error!("❌ Request failed with non-retryable error: {}", e);
                    return Err(e);
                }

                limiter.on_throttle();

                if attempt >= config.max_retries {
                    error!(
                        "❌ Request failed after {} attempts (max retries exhausted): {}",
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }

                attempt += 1;
                let extra = Duration::from_millis(config.retry_backoff_ms * attempt as u64);

                warn!(
                    "⚠️  Request failed (attempt {}/{}): {} - retrying in {}ms (class: {:?})",
                    attempt,
                    config.max_retries,
                    e,
                    extra.as_millis(),
                    class
                );

                tokio::time::sleep(extra).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestError {
        kind: &'static str,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.kind)
        }
    }

    fn classify(e: &TestError) -> FailureClass {
        match e.kind {
            "rate_limit" => FailureClass::RateLimited,
            "timeout" => FailureClass::Timeout,
            _ => FailureClass::Permanent,
        }
    }

    fn quick_limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::with_bounds(2.0, 200.0)
    }

    fn quick_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_immediate_success_decays_delay() {
        let limiter = AdaptiveRateLimiter::with_bounds(100.0, 10_000.0);
        limiter.on_throttle(); // 200ms

        let result = execute_with_retry(
            &limiter,
            &RetryConfig {
                max_retries: 3,
                retry_backoff_ms: 1,
            },
            || async { Ok::<_, TestError>(42) },
            classify,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(limiter.current_delay_ms(), 180); // 200 * 0.9
    }

    #[tokio::test]
    async fn test_decay_is_floored() {
        let limiter = AdaptiveRateLimiter::new();
        assert_eq!(limiter.current_delay_ms(), 100);
        limiter.on_success();
        assert_eq!(limiter.current_delay_ms(), 100);
    }

    #[tokio::test]
    async fn test_growth_is_capped() {
        let limiter = AdaptiveRateLimiter::new();
        for _ in 0..10 {
            limiter.on_throttle();
        }
        assert_eq!(limiter.current_delay_ms(), 10_000);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mut attempts = 0;
        let limiter = quick_limiter();
        let result = execute_with_retry(
            &limiter,
            &quick_config(),
            || {
                attempts += 1;
                async { Err::<i32, _>(TestError { kind: "fatal" }) }
            },
            classify,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_three_rate_limits_then_escalation() {
        // Three consecutive 429s must produce exactly 3 retries with strictly
        // increasing delays, and the 4th failure surfaces to the caller.
        let mut attempts = 0u32;
        let limiter = quick_limiter();
        let mut delays_seen = Vec::new();

        let result = execute_with_retry(
            &limiter,
            &quick_config(),
            || {
                attempts += 1;
                delays_seen.push(limiter.current_delay_ms());
                async { Err::<i32, _>(TestError { kind: "rate_limit" }) }
            },
            classify,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 4); // initial + 3 retries
        // Delay observed at each attempt: 2, 4, 8, 16 - strictly increasing.
        for pair in delays_seen.windows(2) {
            assert!(
                pair[1] > pair[0],
                "delays must strictly increase: {:?}",
                delays_seen
            );
        }
    }

    #[tokio::test]
    async fn test_timeout_retried_until_success() {
        let mut attempts = 0;
        let limiter = quick_limiter();
        let result = execute_with_retry(
            &limiter,
            &quick_config(),
            || {
                attempts += 1;
                let fail = attempts < 3;
                async move {
                    if fail {
                        Err(TestError { kind: "timeout" })
                    } else {
                        Ok(42)
                    }
                }
            },
            classify,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }
}
