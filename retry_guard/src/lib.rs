use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Classification of upstream failures for retry and breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Request or gateway timeout - retry with longer delays
    Timeout,
    /// Connection reset / refused / dropped - retry with longer delays
    Connect,
    /// Retryable HTTP status (500, 502, 503, 520-524)
    RetryableStatus(u16),
    /// Everything else - fail immediately, do not feed the breaker
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Fatal)
    }

    /// Timeout/connect classes back off from a longer base
    fn is_network(&self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::Connect)
    }
}

/// Map an HTTP status code onto a failure kind
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 504 => FailureKind::Timeout,
        500 | 502 | 503 => FailureKind::RetryableStatus(status),
        520..=524 => FailureKind::RetryableStatus(status),
        _ => FailureKind::Fatal,
    }
}

/// Backoff configuration applied uniformly to every guarded call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// Base delay for retryable-status failures
    pub base_delay: Duration,
    /// Base delay for timeout/connect failures
    pub network_base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            network_base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given attempt (1-based)
    fn delay_for(&self, attempt: u32, kind: FailureKind) -> Duration {
        let base = if kind.is_network() {
            self.network_base_delay
        } else {
            self.base_delay
        };

        let exp = base
            .saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
            .min(self.max_delay);

        let jitter_ceiling = (exp.as_millis() / 4).max(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);

        (exp + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive recorded failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before a half-open trial
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Explicit breaker state, shared by construction between the clients that
/// call the same upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate one call. While open, returns the remaining cooldown; the first
    /// check after the cooldown elapses moves to half-open and admits a
    /// single trial.
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    debug!("Circuit breaker cooldown elapsed, allowing half-open trial");
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            // A trial is already in flight
            BreakerState::HalfOpen => Err(Duration::ZERO),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed || inner.failure_count > 0 {
            debug!("Circuit breaker reset to closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            BreakerState::HalfOpen => {
                warn!("Half-open trial failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failure_count
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Error surfaced by a guarded call
#[derive(Error, Debug)]
pub enum GuardError<E> {
    #[error("service temporarily unavailable, retry in {}s", retry_in.as_secs())]
    Open { retry_in: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> GuardError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(e) => Some(e),
            GuardError::Open { .. } => None,
        }
    }
}

/// Run one upstream call through the breaker and the retry policy.
///
/// Fatal failures return immediately and leave the breaker untouched;
/// retryable failures back off between attempts and feed the breaker only
/// once, when the final attempt fails. Success resets the breaker.
pub async fn guarded<F, Fut, T, E>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut operation: F,
    classify: impl Fn(&E) -> FailureKind,
) -> Result<T, GuardError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    if let Err(retry_in) = breaker.check() {
        return Err(GuardError::Open { retry_in });
    }

    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Guarded call succeeded on attempt {}", attempt);
                }
                breaker.record_success();
                return Ok(result);
            }
            Err(e) => {
                let kind = classify(&e);

                if !kind.is_retryable() {
                    error!("Guarded call failed with non-retryable error: {}", e);
                    return Err(GuardError::Inner(e));
                }

                if attempt >= policy.max_attempts {
                    error!(
                        "Guarded call failed after {} attempts: {}",
                        attempt, e
                    );
                    breaker.record_failure();
                    return Err(GuardError::Inner(e));
                }

                let delay = policy.delay_for(attempt, kind);
                warn!(
                    "Guarded call failed (attempt {}/{}): {} - retrying in {}ms ({:?})",
                    attempt,
                    policy.max_attempts,
                    e,
                    delay.as_millis(),
                    kind
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        kind: &'static str,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.kind)
        }
    }

    fn classify_test(e: &TestError) -> FailureKind {
        match e.kind {
            "timeout" => FailureKind::Timeout,
            "server" => FailureKind::RetryableStatus(503),
            _ => FailureKind::Fatal,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            network_base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn status_classification_covers_retryable_codes() {
        assert_eq!(classify_status(500), FailureKind::RetryableStatus(500));
        assert_eq!(classify_status(502), FailureKind::RetryableStatus(502));
        assert_eq!(classify_status(503), FailureKind::RetryableStatus(503));
        assert_eq!(classify_status(521), FailureKind::RetryableStatus(521));
        assert_eq!(classify_status(504), FailureKind::Timeout);
        assert_eq!(classify_status(404), FailureKind::Fatal);
        assert_eq!(classify_status(429), FailureKind::Fatal);
    }

    #[tokio::test]
    async fn immediate_success_resets_breaker() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure();

        let result = guarded(
            &breaker,
            &fast_policy(4),
            || async { Ok::<_, TestError>(42) },
            classify_test,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn fatal_error_does_not_retry_or_count() {
        let breaker = CircuitBreaker::default();
        let attempts = AtomicU32::new(0);

        let result = guarded(
            &breaker,
            &fast_policy(4),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError { kind: "fatal" })
            },
            classify_test,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let breaker = CircuitBreaker::default();
        let attempts = AtomicU32::new(0);

        let result = guarded(
            &breaker,
            &fast_policy(4),
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TestError { kind: "server" })
                } else {
                    Ok(7)
                }
            },
            classify_test,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_count_one_breaker_failure() {
        let breaker = CircuitBreaker::default();
        let attempts = AtomicU32::new(0);

        let result = guarded(
            &breaker,
            &fast_policy(4),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError { kind: "timeout" })
            },
            classify_test,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_rejects_and_recovers() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        });
        let policy = fast_policy(1);
        let attempts = AtomicU32::new(0);

        // Five consecutive classified failures open the breaker
        for _ in 0..5 {
            let _ = guarded(
                &breaker,
                &policy,
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(TestError { kind: "timeout" })
                },
                classify_test,
            )
            .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);

        // While open: immediate rejection, no call made
        let result = guarded(
            &breaker,
            &policy,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(1)
            },
            classify_test,
        )
        .await;
        assert!(matches!(result, Err(GuardError::Open { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);

        // After the cooldown one trial is admitted; success closes
        tokio::time::advance(Duration::from_secs(61)).await;
        let result = guarded(
            &breaker,
            &policy,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(1)
            },
            classify_test,
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
        });

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Second concurrent check is rejected while the trial is in flight
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
