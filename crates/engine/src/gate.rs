use crate::shutdown::Shutdown;
use api_client::error::ApiError;
use configuration::{RateGateConfig, RetryConfig};
use core_types::FailureKind;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant as StdInstant;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};

/// The kinds of exchange call that pass through the gate. All share one budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallCategory {
    CandleData,
    PlaceOrder,
}

impl CallCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallCategory::CandleData => "candle_data",
            CallCategory::PlaceOrder => "place_order",
        }
    }
}

impl fmt::Display for CallCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first included.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
        }
    }
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("{category} call failed after {attempts} attempts: {last}")]
    Exhausted {
        category: CallCategory,
        attempts: u32,
        last: ApiError,
    },

    #[error("{category} call rejected: {source}")]
    Rejected {
        category: CallCategory,
        #[source]
        source: ApiError,
    },

    #[error("{0} call cancelled by shutdown")]
    Cancelled(CallCategory),
}

impl GateError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GateError::Exhausted { .. } => FailureKind::ApiExhausted,
            GateError::Rejected { .. } => FailureKind::NonRetryable,
            GateError::Cancelled(_) => FailureKind::Cancelled,
        }
    }
}

/// A snapshot of the sliding window for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    /// Admission time of the oldest call still inside the window.
    pub window_start: Option<Instant>,
    pub calls_in_window: u32,
    pub max_calls_per_window: u32,
    pub in_flight: usize,
    /// Calls admitted since the gate was built.
    pub admitted_total: u64,
}

/// Proof of admission. Holds one in-flight slot until dropped.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

/// Reads tokio's clock, so the limiter follows a paused runtime in tests.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = StdInstant;

    fn now(&self) -> StdInstant {
        Instant::now().into_std()
    }
}

type WindowLimiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<StdInstant>>;

/// Spaces admissions `window / max_calls` apart with no burst, so any trailing
/// window holds at most `max_calls` of them.
fn window_quota(window: Duration, max_calls: u32) -> Quota {
    let period = (window / max_calls).max(Duration::from_nanos(1));
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(NonZeroU32::MIN)
}

/// Process-wide admission control for outbound exchange calls.
///
/// A call is admitted once it holds an in-flight slot and the GCRA limiter lets it
/// through. Waiters are served in arrival order: the admission ticket is a fair
/// async mutex that the head of the queue keeps while it waits on the limiter.
pub struct RateGate {
    window: Duration,
    max_calls: u32,
    admission: Mutex<()>,
    limiter: WindowLimiter,
    clock: TokioClock,
    /// Recent admission times, kept for `budget()` only.
    recent: StdMutex<VecDeque<Instant>>,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    admitted: AtomicU64,
    candle_retry: RetryPolicy,
    order_retry: RetryPolicy,
    shutdown: Shutdown,
}

impl RateGate {
    pub fn new(config: &RateGateConfig, shutdown: Shutdown) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        let max_calls = config.max_calls_per_window.max(1);
        let window = config.window();
        let clock = TokioClock;
        Self {
            window,
            max_calls,
            admission: Mutex::new(()),
            limiter: RateLimiter::direct_with_clock(window_quota(window, max_calls), &clock),
            clock,
            recent: StdMutex::new(VecDeque::new()),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            admitted: AtomicU64::new(0),
            candle_retry: RetryPolicy::from(config.retry_for(CallCategory::CandleData.as_str())),
            order_retry: RetryPolicy::from(config.retry_for(CallCategory::PlaceOrder.as_str())),
            shutdown,
        }
    }

    pub fn retry_policy(&self, category: CallCategory) -> RetryPolicy {
        match category {
            CallCategory::CandleData => self.candle_retry,
            CallCategory::PlaceOrder => self.order_retry,
        }
    }

    /// Waits for a call slot. Only fails when the stop signal fires first.
    pub async fn acquire(&self, category: CallCategory) -> Result<RatePermit, GateError> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(GateError::Cancelled(category)),
            permit = self.admit(category) => permit,
        }
    }

    async fn admit(&self, category: CallCategory) -> Result<RatePermit, GateError> {
        // The in-flight slot comes first so an admitted call can start at once and the
        // exchange sees calls at their admission times.
        let slot = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Cancelled(category))?;

        let _ticket = self.admission.lock().await;
        while let Err(not_until) = self.limiter.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            tracing::trace!(category = %category, wait = ?wait, "Rate window full, waiting");
            sleep(wait).await;
        }

        let now = Instant::now();
        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.push_back(now);
            while recent.front().is_some_and(|&at| now.duration_since(at) >= self.window) {
                recent.pop_front();
            }
        }
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(RatePermit { _slot: slot })
    }

    /// Runs `operation` under the gate with the category's retry policy.
    ///
    /// Every attempt takes its own permit and gives it back when the attempt ends.
    /// The pause between attempts and the wait for a permit end early on the stop
    /// signal; an attempt already running is always awaited.
    pub async fn execute<T, F, Fut>(&self, category: CallCategory, mut operation: F) -> Result<T, GateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let policy = self.retry_policy(category);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let permit = self.acquire(category).await?;
            let result = operation().await;
            drop(permit);

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::warn!(category = %category, attempt, error = %err, "Non-retryable API error");
                return Err(GateError::Rejected {
                    category,
                    source: err,
                });
            }
            if attempt >= policy.max_attempts {
                tracing::warn!(category = %category, attempts = attempt, error = %err, "Retries exhausted");
                return Err(GateError::Exhausted {
                    category,
                    attempts: attempt,
                    last: err,
                });
            }

            tracing::debug!(category = %category, attempt, error = %err, "Retryable API error, backing off");
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return Err(GateError::Cancelled(category)),
                _ = sleep(policy.delay) => {}
            }
        }
    }

    pub fn budget(&self) -> RateBudget {
        let now = Instant::now();
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let live: Vec<Instant> = recent
            .iter()
            .copied()
            .filter(|&at| now.duration_since(at) < self.window)
            .collect();

        RateBudget {
            window_start: live.first().copied(),
            calls_in_window: live.len() as u32,
            max_calls_per_window: self.max_calls,
            in_flight: self.max_in_flight - self.in_flight.available_permits(),
            admitted_total: self.admitted.load(Ordering::Relaxed),
        }
    }
}
